//! Replays recorded `StandardEvent` JSON lines from a file
//!
//! Poll mode hands out `batch_size` events per poll; stream mode pushes the
//! whole file, optionally paced by `interval_ms`. With `repeat` set the file
//! starts over when it runs out.

use super::registry::BuildConnector;
use super::{ConnectorMode, ConnectorSettings, DataConnector};
use crate::error::ConnectorError;
use crate::event::StandardEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_BATCH_SIZE: usize = 100;

struct Cursor {
    lines: Vec<String>,
    position: usize,
}

pub struct JsonlReplayConnector {
    name: String,
    path: PathBuf,
    mode: ConnectorMode,
    batch_size: usize,
    repeat: bool,
    interval: Option<Duration>,
    cursor: Mutex<Option<Cursor>>,
    skipped: AtomicU64,
}

impl JsonlReplayConnector {
    pub const KIND: &'static str = "jsonl_replay";

    /// Lines that failed to decode
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn decode(&self, line: &str) -> Option<StandardEvent> {
        match serde_json::from_str::<StandardEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️  {}: skipping undecodable line: {}", self.name, e);
                None
            }
        }
    }

    /// Next `n` raw lines, wrapping around when `repeat` is set
    fn take_lines(&self, n: usize) -> Result<Vec<String>, ConnectorError> {
        let mut guard = self.cursor.lock();
        let cursor = guard
            .as_mut()
            .ok_or_else(|| ConnectorError::NotConnected(self.name.clone()))?;

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if cursor.position >= cursor.lines.len() {
                if !self.repeat || cursor.lines.is_empty() {
                    break;
                }
                cursor.position = 0;
            }
            out.push(cursor.lines[cursor.position].clone());
            cursor.position += 1;
        }
        Ok(out)
    }
}

impl BuildConnector for JsonlReplayConnector {
    fn build(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let path = settings
            .param_str("path")
            .map(str::to_string)
            .or_else(|| settings.url.clone())
            .ok_or_else(|| ConnectorError::InvalidSettings(format!("{}: params.path is required", settings.name)))?;

        let batch_size = settings
            .param_u64("batch_size")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConnectorError::InvalidSettings(format!(
                "{}: batch_size must be at least 1",
                settings.name
            )));
        }

        Ok(Self {
            name: settings.name.clone(),
            path: PathBuf::from(path),
            mode: settings.mode,
            batch_size,
            repeat: settings.param_bool("repeat").unwrap_or(false),
            interval: settings.param_u64("interval_ms").map(Duration::from_millis),
            cursor: Mutex::new(None),
            skipped: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl DataConnector for JsonlReplayConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> ConnectorMode {
        self.mode
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConnectorError::Unreachable(format!("{}: {}", self.path.display(), e)))?;
        let lines: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        log::info!("📼 {}: loaded {} recorded events from {}", self.name, lines.len(), self.path.display());
        *self.cursor.lock() = Some(Cursor { lines, position: 0 });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        *self.cursor.lock() = None;
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError> {
        let lines = self.take_lines(self.batch_size)?;
        Ok(lines.iter().filter_map(|l| self.decode(l)).collect())
    }

    async fn stream(&self, sink: mpsc::Sender<StandardEvent>) -> Result<(), ConnectorError> {
        loop {
            let lines = self.take_lines(self.batch_size)?;
            if lines.is_empty() {
                log::info!("📼 {}: replay finished", self.name);
                return Ok(());
            }
            for line in lines {
                let Some(event) = self.decode(&line) else { continue };
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
                if let Some(interval) = self.interval {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}
