//! External broker seam for the cross-process bus

use crate::error::EventBusError;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, Mutex};

const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Glob subset used for pattern subscriptions: exact name or `prefix*`
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EventBusError>;

    /// Subscribe to every channel matching `pattern`
    ///
    /// Messages arrive on the returned receiver until it is dropped or the
    /// broker connection ends.
    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>, EventBusError>;

    fn name(&self) -> &'static str;
}

/// Broker living inside the process
///
/// Clones share the same channel space, so several bus instances can be
/// bridged without an external server (single-host runs and tests).
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EventBusError> {
        // no receivers is fine, pub/sub semantics drop the message
        let _ = self.tx.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>, EventBusError> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if !pattern_matches(&pattern, &msg.channel) {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("⚠️  Memory broker subscriber lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis pub/sub broker
pub struct RedisBroker {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self, EventBusError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, EventBusError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        log::info!("🔌 Connected to Redis broker");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EventBusError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        if let Err(e) = result {
            // drop the cached connection so the next publish reconnects
            *self.conn.lock().await = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>, EventBusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, out) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("⚠️  Unreadable Redis payload on {}: {}", msg.get_channel_name(), e);
                        continue;
                    }
                };
                let message = BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            log::warn!("⚠️  Redis subscription '{}' ended", pattern);
        });

        Ok(out)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
