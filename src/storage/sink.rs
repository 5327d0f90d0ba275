//! Bus subscriber that persists every event through the repository
//!
//! The bus handler only enqueues; a writer task owned by the sink does the
//! saving, so retry sleeps never run inside a bus delivery. A full queue
//! sends the event straight to the buffer. A save is retried with backoff. When the repository keeps failing the
//! event is parked in a bounded buffer that drains on the next successful
//! save or on a scheduled `flush_buffer`. Once the buffer is full new events
//! are dropped and counted. Storage trouble shows up in health, never as
//! back-pressure on ingestion.

use super::EventRepository;
use crate::backoff::ExponentialBackoff;
use crate::bus::{EventBus, EventFilter, EventHandler, Priority, SubscriptionHandle};
use crate::error::{CoreError, StorageError};
use crate::event::StandardEvent;
use crate::orchestration::{Component, ComponentType, CoreContext, HealthReport, HealthStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StorageSinkConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub buffer_capacity: usize,
    /// Events waiting for the writer task
    pub queue_capacity: usize,
    /// Consecutive failed saves before the sink reports Unhealthy
    pub fail_after: u32,
}

impl Default for StorageSinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            buffer_capacity: 10_000,
            queue_capacity: 1024,
            fail_after: 5,
        }
    }
}

struct SinkState {
    repository: Arc<dyn EventRepository>,
    config: StorageSinkConfig,
    buffer: Mutex<VecDeque<StandardEvent>>,
    flushing: AtomicBool,
    saved: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl SinkState {
    async fn save_with_retry(&self, event: &StandardEvent) -> Result<(), StorageError> {
        let mut backoff = ExponentialBackoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.max_retries,
        );
        loop {
            match self.repository.save(event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => match backoff.next_delay() {
                    Ok(delay) => {
                        log::debug!(
                            "⏳ Save of {} failed ({}), retrying in {}ms",
                            event.event_id,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(_) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist(&self, event: &StandardEvent) {
        match self.save_with_retry(event).await {
            Ok(()) => {
                self.saved.fetch_add(1, Ordering::Relaxed);
                if self.consecutive_failures.swap(0, Ordering::AcqRel) > 0 {
                    log::info!("✅ Storage recovered ({})", self.repository.name());
                }
                let backlog = self.buffer.lock().len();
                if backlog > 0 {
                    if let Err(e) = self.flush_buffer().await {
                        log::warn!("⚠️  Buffered events still pending: {}", e);
                    }
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                *self.last_error.lock() = Some(e.to_string());
                self.park(event.clone());
                log::warn!(
                    "⚠️  Storage save failed {} time(s) in a row: {} (buffered: {})",
                    failures,
                    e,
                    self.buffer.lock().len()
                );
            }
        }
    }

    fn park(&self, event: StandardEvent) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.config.buffer_capacity {
            drop(buffer);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("🗑️  Storage buffer full, dropped {} ({} dropped total)", event.event_id, dropped);
            return;
        }
        buffer.push_back(event);
    }

    /// Drain buffered events oldest first; stops at the first failure
    async fn flush_buffer(&self) -> Result<usize, StorageError> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let mut flushed = 0;
        let result = loop {
            let next = self.buffer.lock().pop_front();
            let Some(event) = next else {
                break Ok(flushed);
            };
            match self.repository.save(&event).await {
                Ok(()) => {
                    flushed += 1;
                    self.saved.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.buffer.lock().push_front(event);
                    break Err(e);
                }
            }
        };
        self.flushing.store(false, Ordering::Release);
        if flushed > 0 {
            log::info!("💾 Flushed {} buffered events", flushed);
        }
        result
    }
}

struct SinkHandler {
    state: Arc<SinkState>,
    queue: mpsc::Sender<StandardEvent>,
}

#[async_trait]
impl EventHandler for SinkHandler {
    fn name(&self) -> &str {
        "storage_sink"
    }

    async fn handle(&self, event: &StandardEvent) -> Result<(), CoreError> {
        match self.queue.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("🐢 Storage queue full, buffering {}", event.event_id);
                self.state.park(event);
            }
            Err(TrySendError::Closed(event)) => self.state.park(event),
        }
        Ok(())
    }
}

async fn run_writer(
    state: Arc<SinkState>,
    mut queue: mpsc::Receiver<StandardEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(event) => state.persist(&event).await,
                None => return,
            },
            _ = shutdown.changed() => break,
        }
    }
    // finish what was accepted before the stop
    queue.close();
    while let Some(event) = queue.recv().await {
        state.persist(&event).await;
    }
}

pub struct StorageSink {
    state: Arc<SinkState>,
    subscription: Mutex<Option<(Arc<dyn EventBus>, SubscriptionHandle)>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StorageSink {
    pub fn new(repository: Arc<dyn EventRepository>, config: StorageSinkConfig) -> Self {
        Self {
            state: Arc::new(SinkState {
                repository,
                config,
                buffer: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                saved: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                last_error: Mutex::new(None),
            }),
            subscription: Mutex::new(None),
            shutdown: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub async fn persist(&self, event: &StandardEvent) {
        self.state.persist(event).await
    }

    pub async fn flush_buffer(&self) -> Result<usize, StorageError> {
        self.state.flush_buffer().await
    }

    pub fn buffered(&self) -> usize {
        self.state.buffer.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    pub fn saved(&self) -> u64 {
        self.state.saved.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Component for StorageSink {
    fn name(&self) -> &str {
        "storage"
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Storage
    }

    async fn start(&self, ctx: &CoreContext) -> Result<(), CoreError> {
        let (queue, rx) = mpsc::channel(self.state.config.queue_capacity.max(1));
        let (tx, shutdown) = watch::channel(false);
        let writer = tokio::spawn(run_writer(self.state.clone(), rx, shutdown));
        *self.shutdown.lock() = Some(tx);
        *self.writer.lock() = Some(writer);

        let handle = ctx.bus.subscribe(
            Arc::new(SinkHandler {
                state: self.state.clone(),
                queue,
            }),
            EventFilter::all(),
            Priority::Low,
        );
        *self.subscription.lock() = Some((ctx.bus.clone(), handle));
        log::info!("💾 Storage sink persisting to {}", self.state.repository.name());
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
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Err(e) = self.flush_buffer().await {
            log::warn!("⚠️  {} buffered events not persisted at shutdown: {}", self.buffered(), e);
        }
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        let failures = self.state.consecutive_failures.load(Ordering::Acquire);
        let detail = format!(
            "{} saved, {} buffered, {} dropped",
            self.saved(),
            self.buffered(),
            self.dropped()
        );
        let status = if failures == 0 {
            HealthStatus::Healthy
        } else if failures < self.state.config.fail_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        HealthReport::with_status(status, detail).with_error(self.state.last_error.lock().clone())
    }
}
