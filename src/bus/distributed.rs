//! Cross-process event bus
//!
//! Local publishes are delivered to local subscribers once, directly, and then
//! forwarded to the broker on `events:{event_type}`. The inbound listener
//! drops envelopes this instance sent itself and re-publishes every other
//! envelope to local subscribers exactly once. A subscriber therefore never
//! sees the same event twice, whichever process produced it.

use super::broker::Broker;
use super::local::InProcessBus;
use super::{channel_for, BusStats, EventBus, EventFilter, EventHandler, Priority, SubscriptionHandle};
use crate::error::EventBusError;
use crate::event::{new_event_id, StandardEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const SUBSCRIBE_PATTERN: &str = "events:*";

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    origin: String,
    event: StandardEvent,
}

#[derive(Default)]
struct BridgeCounters {
    forwarded: AtomicU64,
    received: AtomicU64,
    echoes: AtomicU64,
    malformed: AtomicU64,
}

pub struct CrossProcessBus {
    local: Arc<InProcessBus>,
    broker: Arc<dyn Broker>,
    instance_id: String,
    running: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<BridgeCounters>,
}

impl CrossProcessBus {
    pub fn new(local: Arc<InProcessBus>, broker: Arc<dyn Broker>) -> Self {
        Self::with_instance_id(local, broker, new_event_id())
    }

    pub fn with_instance_id(local: Arc<InProcessBus>, broker: Arc<dyn Broker>, instance_id: impl Into<String>) -> Self {
        Self {
            local,
            broker,
            instance_id: instance_id.into(),
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
            counters: Arc::new(BridgeCounters::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Inbound envelopes dropped because this instance published them
    pub fn echoes_skipped(&self) -> u64 {
        self.counters.echoes.load(Ordering::Relaxed)
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.counters.malformed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventBus for CrossProcessBus {
    async fn publish(&self, event: StandardEvent) -> Result<(), EventBusError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EventBusError::Stopped);
        }

        self.local.deliver(&event).await;

        let channel = channel_for(event.event_type);
        let envelope = WireEnvelope {
            origin: self.instance_id.clone(),
            event,
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.broker.publish(&channel, payload).await?;
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
        priority: Priority,
    ) -> SubscriptionHandle {
        self.local.subscribe(handler, filter, priority)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.local.unsubscribe(handle)
    }

    async fn start(&self) -> Result<(), EventBusError> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut inbound = self.broker.psubscribe(SUBSCRIBE_PATTERN).await?;
        let local = self.local.clone();
        let instance_id = self.instance_id.clone();
        let counters = self.counters.clone();

        let handle = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let envelope: WireEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(env) => env,
                    Err(e) => {
                        counters.malformed.fetch_add(1, Ordering::Relaxed);
                        log::warn!("⚠️  Dropping malformed message on {}: {}", message.channel, e);
                        continue;
                    }
                };

                if envelope.origin == instance_id {
                    counters.echoes.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                if let Err(e) = envelope.event.validate() {
                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("⚠️  Dropping invalid event from {}: {}", envelope.origin, e);
                    continue;
                }

                counters.received.fetch_add(1, Ordering::Relaxed);
                local.deliver(&envelope.event).await;
            }
            log::warn!("⚠️  Cross-process bus listener stopped");
        });

        *self.listener.lock() = Some(handle);
        self.local.start().await?;
        self.running.store(true, Ordering::Release);
        log::info!(
            "🔗 Cross-process bus started (broker: {}, instance: {})",
            self.broker.name(),
            self.instance_id
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), EventBusError> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.local.stop().await
    }

    fn stats(&self) -> BusStats {
        let mut stats = self.local.stats();
        stats.forwarded = self.counters.forwarded.load(Ordering::Relaxed);
        stats.received = self.counters.received.load(Ordering::Relaxed);
        stats
    }

    fn subscriber_count(&self) -> usize {
        self.local.subscriber_count()
    }

    fn backend(&self) -> &'static str {
        "cross_process"
    }
}
