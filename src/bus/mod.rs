//! Publish/subscribe routing fabric
//!
//! Two interchangeable backends implement [`EventBus`]:
//! - [`InProcessBus`]: direct invocation inside one address space
//! - [`CrossProcessBus`]: bridges processes through a [`Broker`] on
//!   `events:{event_type}` channels and re-publishes inbound events locally
//!
//! Delivery order for one publish: every High subscriber, then Normal, then
//! Low; inside a tier, registration order. Each handler call is isolated
//! (errors, panics and time budget overruns are contained and reported as
//! `bus_error` events) so one bad handler never blocks the others.

pub mod broker;
pub mod distributed;
pub mod local;

use crate::error::{CoreError, EventBusError};
use crate::event::{EventType, StandardEvent};
use crate::orchestration::{Component, ComponentType, CoreContext, HealthReport, HealthStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub use broker::{Broker, BrokerMessage, MemoryBroker, RedisBroker};
pub use distributed::CrossProcessBus;
pub use local::{DeliveryReport, InProcessBus};

/// Channel name for an event type on an external broker
pub fn channel_for(event_type: EventType) -> String {
    format!("events:{}", event_type.as_str())
}

/// Inverse of [`channel_for`]
pub fn event_type_from_channel(channel: &str) -> Option<EventType> {
    channel.strip_prefix("events:")?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Which events a subscriber wants
///
/// An empty event type set means every type. `None` for symbols or sources
/// means no restriction on that field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_types: HashSet<EventType>,
    pub symbols: Option<HashSet<String>>,
    pub sources: Option<HashSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types<I: IntoIterator<Item = EventType>>(types: I) -> Self {
        Self {
            event_types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, event: &StandardEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(&event.symbol) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        true
    }
}

/// Returned by `subscribe`; pass it back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub handler: String,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &StandardEvent) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    pub error_events: u64,
    /// Events sent to the external broker (cross-process backend only)
    pub forwarded: u64,
    /// Foreign events received from the broker (cross-process backend only)
    pub received: u64,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `event` to every matching subscriber
    ///
    /// Handler failures never surface here; only infrastructure failures do.
    async fn publish(&self, event: StandardEvent) -> Result<(), EventBusError>;

    fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
        priority: Priority,
    ) -> SubscriptionHandle;

    /// Remove a subscription; returns false if it was already gone
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool;

    async fn start(&self) -> Result<(), EventBusError>;

    async fn stop(&self) -> Result<(), EventBusError>;

    fn stats(&self) -> BusStats;

    fn subscriber_count(&self) -> usize;

    fn backend(&self) -> &'static str;
}

/// Lifecycle wrapper so the bus starts first and stops last
pub struct BusComponent {
    bus: Arc<dyn EventBus>,
}

impl BusComponent {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Component for BusComponent {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Bus
    }

    async fn start(&self, _ctx: &CoreContext) -> Result<(), CoreError> {
        self.bus.start().await?;
        log::info!("📡 Event bus running ({} backend)", self.bus.backend());
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        self.bus.stop().await?;
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        let stats = self.bus.stats();
        let detail = format!(
            "{} subscribers, {} published, {} handler failures",
            self.bus.subscriber_count(),
            stats.published,
            stats.handler_failures + stats.handler_timeouts
        );
        HealthReport::with_status(HealthStatus::Healthy, detail)
    }
}
