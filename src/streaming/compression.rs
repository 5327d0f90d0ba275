//! Outbound frame encoding with optional gzip

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const DEFAULT_THRESHOLD: usize = 1024;

/// One encoded server message, ready for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Compressed(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Compressed(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Frame::Compressed(_))
    }
}

#[derive(Debug, Clone)]
pub struct MessageCompressor {
    threshold: usize,
    level: Compression,
}

impl Default for MessageCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl MessageCompressor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: Compression::fast(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Gzip `text` when the client negotiated compression and it is big enough
    ///
    /// Falls back to plain text if the encoder fails.
    pub fn encode(&self, text: String, client_accepts: bool) -> Frame {
        if !client_accepts || text.len() < self.threshold {
            return Frame::Text(text);
        }
        match self.gzip(text.as_bytes()) {
            Ok(bytes) => Frame::Compressed(Bytes::from(bytes)),
            Err(e) => {
                log::warn!("⚠️  gzip failed, sending uncompressed: {}", e);
                Frame::Text(text)
            }
        }
    }

    fn gzip(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}

pub fn decompress(data: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}
