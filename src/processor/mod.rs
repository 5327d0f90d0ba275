//! Event transformation pipeline
//!
//! A [`Processor`] turns one input event into zero or more derived events.
//! [`ProcessorHost`] wires a processor onto the bus: it subscribes for the
//! processor's input types, isolates failures per event and publishes the
//! derived events from a FIFO outbox, so stages compose purely through
//! event types.

pub mod position;
pub mod scoring;
pub mod signal;

use crate::bus::{EventBus, EventFilter, EventHandler, Priority, SubscriptionHandle};
use crate::error::{CoreError, ProcessorError};
use crate::event::{EventType, StandardEvent};
use crate::orchestration::{Component, ComponentType, CoreContext, HealthReport, HealthStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use position::{classify, PositionInference};
pub use scoring::{DefaultScoreModel, ScoreModel, ScoringWeights, TraderScoring, TraderStats};
pub use signal::{SignalConfig, SignalGeneration};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Consecutive failed events before the host reports Unhealthy
const UNHEALTHY_AFTER: u32 = 10;

pub trait Processor: Send {
    fn name(&self) -> &str;

    fn input_types(&self) -> Vec<EventType>;

    fn process(&mut self, event: &StandardEvent) -> Result<Vec<StandardEvent>, ProcessorError>;

    /// Close whatever windows have ended by `now`
    fn tick(&mut self, _now: DateTime<Utc>) -> Vec<StandardEvent> {
        Vec::new()
    }
}

#[derive(Default)]
struct HostCounters {
    processed: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    loops_skipped: AtomicU64,
    emitted: AtomicU64,
    invalid_output: AtomicU64,
    outbox_dropped: AtomicU64,
}

struct HostState {
    name: String,
    inputs: Vec<EventType>,
    processor: Mutex<Box<dyn Processor>>,
    outbox: mpsc::Sender<StandardEvent>,
    counters: HostCounters,
    last_error: Mutex<Option<String>>,
}

impl HostState {
    fn on_event(&self, event: &StandardEvent) {
        if event.derived_by(&self.name) {
            self.counters.loops_skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!("🔁 {} skipping its own descendant {}", self.name, event.event_id);
            return;
        }

        let outcome = {
            let mut processor = self.processor.lock();
            std::panic::catch_unwind(AssertUnwindSafe(|| processor.process(event)))
        };
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::failed(&self.name, "panicked")),
        };

        match result {
            Ok(derived) => {
                self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                self.enqueue(derived);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️  {} failed on {} ({}): {}", self.name, event.event_id, event.event_type, e);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }

    fn tick(&self, now: DateTime<Utc>) -> usize {
        let derived = self.processor.lock().tick(now);
        self.enqueue(derived)
    }

    fn enqueue(&self, derived: Vec<StandardEvent>) -> usize {
        let mut queued = 0;
        for event in derived {
            if let Err(e) = event.validate() {
                self.counters.invalid_output.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️  {} produced an invalid {} event: {}", self.name, event.event_type, e);
                continue;
            }
            match self.outbox.try_send(event) {
                Ok(()) => {
                    queued += 1;
                    self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.counters.outbox_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("⚠️  {} outbox full, dropped {}", self.name, event.event_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.counters.outbox_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        queued
    }
}

struct ProcessorHandler(Arc<HostState>);

#[async_trait]
impl EventHandler for ProcessorHandler {
    fn name(&self) -> &str {
        &self.0.name
    }

    async fn handle(&self, event: &StandardEvent) -> Result<(), CoreError> {
        self.0.on_event(event);
        Ok(())
    }
}

async fn pump(mut outbox: mpsc::Receiver<StandardEvent>, bus: Arc<dyn EventBus>, name: String, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            next = outbox.recv() => match next {
                Some(event) => publish(&bus, &name, event).await,
                None => return,
            },
            _ = shutdown.changed() => break,
        }
    }
    while let Ok(event) = outbox.try_recv() {
        publish(&bus, &name, event).await;
    }
}

async fn publish(bus: &Arc<dyn EventBus>, name: &str, event: StandardEvent) {
    if let Err(e) = bus.publish(event).await {
        log::error!("❌ {} could not publish derived event: {}", name, e);
    }
}

/// Runs a processor as a bus subscriber
pub struct ProcessorHost {
    state: Arc<HostState>,
    receiver: Mutex<Option<mpsc::Receiver<StandardEvent>>>,
    subscription: Mutex<Option<(Arc<dyn EventBus>, SubscriptionHandle)>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorHost {
    pub fn new(processor: Box<dyn Processor>) -> Self {
        Self::with_outbox_capacity(processor, DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_outbox_capacity(processor: Box<dyn Processor>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            state: Arc::new(HostState {
                name: processor.name().to_string(),
                inputs: processor.input_types(),
                processor: Mutex::new(processor),
                outbox: tx,
                counters: HostCounters::default(),
                last_error: Mutex::new(None),
            }),
            receiver: Mutex::new(Some(rx)),
            subscription: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Process one event directly, bypassing the bus subscription
    pub fn process(&self, event: &StandardEvent) {
        self.state.on_event(event)
    }

    /// Run window closes; returns the number of events queued
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        self.state.tick(now)
    }

    pub fn processed(&self) -> u64 {
        self.state.counters.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.state.counters.failures.load(Ordering::Relaxed)
    }

    pub fn loops_skipped(&self) -> u64 {
        self.state.counters.loops_skipped.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.state.counters.emitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Component for ProcessorHost {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Processor
    }

    async fn start(&self, ctx: &CoreContext) -> Result<(), CoreError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| CoreError::other(format!("{} was already started", self.state.name)))?;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pump(receiver, ctx.bus.clone(), self.state.name.clone(), rx));
        *self.shutdown.lock() = Some(tx);
        *self.task.lock() = Some(handle);

        let subscription = ctx.bus.subscribe(
            Arc::new(ProcessorHandler(self.state.clone())),
            EventFilter::types(self.state.inputs.iter().copied()),
            Priority::Normal,
        );
        *self.subscription.lock() = Some((ctx.bus.clone(), subscription));

        let inputs: Vec<&str> = self.state.inputs.iter().map(|t| t.as_str()).collect();
        log::info!("⚙️  {} consuming [{}]", self.state.name, inputs.join(", "));
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        let subscription = self.subscription.lock().take();
        if let Some((bus, handle)) = subscription {
            bus.unsubscribe(&handle);
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        if self.task.lock().is_none() {
            return HealthReport::with_status(HealthStatus::Stopped, "not running");
        }
        let counters = &self.state.counters;
        let consecutive = counters.consecutive_failures.load(Ordering::Relaxed);
        let status = match consecutive {
            0 => HealthStatus::Healthy,
            n if n < UNHEALTHY_AFTER => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };
        let detail = format!(
            "{} processed, {} failed, {} emitted, {} outbox drops",
            counters.processed.load(Ordering::Relaxed),
            counters.failures.load(Ordering::Relaxed),
            counters.emitted.load(Ordering::Relaxed),
            counters.outbox_dropped.load(Ordering::Relaxed)
        );
        HealthReport::with_status(status, detail).with_error(self.state.last_error.lock().clone())
    }
}
