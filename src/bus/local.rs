//! In-process event bus
//!
//! The subscriber list is copy-on-write: `publish` clones an `Arc` snapshot
//! under a short read lock and delivers from it, so subscribe/unsubscribe can
//! run concurrently with deliveries in flight.

use super::{BusStats, EventBus, EventFilter, EventHandler, Priority, SubscriptionHandle};
use crate::error::EventBusError;
use crate::event::{BusErrorPayload, EventType, StandardEvent};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

struct Subscriber {
    id: u64,
    priority: Priority,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    deliveries: AtomicU64,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,
    error_events: AtomicU64,
}

/// Outcome of delivering one event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

struct HandlerFailure {
    handler: String,
    reason: String,
}

pub struct InProcessBus {
    subscribers: RwLock<Arc<Vec<Arc<Subscriber>>>>,
    next_id: AtomicU64,
    handler_timeout: Duration,
    running: AtomicBool,
    counters: Counters,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_handler_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    /// Bus whose handlers each get at most `handler_timeout` per delivery
    pub fn with_handler_timeout(handler_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            handler_timeout,
            running: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// Deliver to local subscribers regardless of running state
    ///
    /// Failed deliveries are turned into `bus_error` events and delivered to
    /// their subscribers; a failure while handling a `bus_error` event is only
    /// logged.
    pub async fn deliver(&self, event: &StandardEvent) -> DeliveryReport {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let (report, failures) = self.dispatch(event).await;

        if event.event_type != EventType::BusError {
            for failure in failures {
                let payload = BusErrorPayload {
                    handler: failure.handler,
                    failed_event_id: event.event_id.clone(),
                    failed_event_type: event.event_type.to_string(),
                    reason: failure.reason,
                };
                let value = match serde_json::to_value(&payload) {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("Failed to encode bus error payload: {}", e);
                        continue;
                    }
                };
                let error_event = StandardEvent::derive(event, "event_bus", EventType::BusError, event.symbol.clone(), value);
                self.counters.error_events.fetch_add(1, Ordering::Relaxed);
                self.dispatch(&error_event).await;
            }
        }

        report
    }

    async fn dispatch(&self, event: &StandardEvent) -> (DeliveryReport, Vec<HandlerFailure>) {
        let snapshot = self.subscribers.read().clone();
        let mut report = DeliveryReport::default();
        let mut failures = Vec::new();

        for sub in snapshot.iter().filter(|s| s.filter.matches(event)) {
            report.matched += 1;
            let call = AssertUnwindSafe(sub.handler.handle(event)).catch_unwind();

            let reason = match tokio::time::timeout(self.handler_timeout, call).await {
                Ok(Ok(Ok(()))) => {
                    report.delivered += 1;
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_)) => "handler panicked".to_string(),
                Err(_) => {
                    self.counters.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                    format!("handler exceeded {}ms budget", self.handler_timeout.as_millis())
                }
            };

            report.failed += 1;
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "⚠️  Handler '{}' failed on {} {} ({}): {}",
                sub.handler.name(),
                event.event_type,
                event.symbol,
                event.event_id,
                reason
            );
            failures.push(HandlerFailure {
                handler: sub.handler.name().to_string(),
                reason,
            });
        }

        (report, failures)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, event: StandardEvent) -> Result<(), EventBusError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EventBusError::Stopped);
        }
        self.deliver(&event).await;
        Ok(())
    }

    fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
        priority: Priority,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle {
            id,
            handler: handler.name().to_string(),
        };

        let mut guard = self.subscribers.write();
        let mut next: Vec<Arc<Subscriber>> = guard.as_ref().clone();
        next.push(Arc::new(Subscriber {
            id,
            priority,
            filter,
            handler,
        }));
        // ids grow with registration, so this is tier first, then registration order
        next.sort_by_key(|s| (s.priority.rank(), s.id));
        *guard = Arc::new(next);

        log::debug!("Subscribed '{}' (id={}, priority={:?})", handle.handler, id, priority);
        handle
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut guard = self.subscribers.write();
        if !guard.iter().any(|s| s.id == handle.id) {
            return false;
        }
        let next: Vec<Arc<Subscriber>> = guard.iter().filter(|s| s.id != handle.id).cloned().collect();
        *guard = Arc::new(next);
        log::debug!("Unsubscribed '{}' (id={})", handle.handler, handle.id);
        true
    }

    async fn start(&self) -> Result<(), EventBusError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EventBusError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: self.counters.handler_timeouts.load(Ordering::Relaxed),
            error_events: self.counters.error_events.load(Ordering::Relaxed),
            forwarded: 0,
            received: 0,
        }
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn backend(&self) -> &'static str {
        "in_process"
    }
}
