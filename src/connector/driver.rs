//! Runs one connector: state tracking, backoff, validation and publishing

use super::{ConnectionTracker, ConnectorMode, ConnectorState, DataConnector, TrackerConfig};
use crate::bus::EventBus;
use crate::error::{ConnectorError, CoreError};
use crate::event::{SourceClock, StandardEvent};
use crate::orchestration::{Component, ComponentType, CoreContext, HealthRegistry, HealthReport, HealthStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const STREAM_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Events published this round
    Published(usize),
    /// Still waiting out a backoff delay
    Backoff,
    Failed,
}

struct DriverState {
    connector: Arc<dyn DataConnector>,
    bus: Arc<dyn EventBus>,
    tracker: Mutex<ConnectionTracker>,
    clock: Mutex<SourceClock>,
    health: Mutex<Option<Arc<HealthRegistry>>>,
    published: AtomicU64,
    invalid: AtomicU64,
}

impl DriverState {
    fn name(&self) -> &str {
        self.connector.name()
    }

    fn state(&self) -> ConnectorState {
        self.tracker.lock().state()
    }

    async fn connect(&self) -> bool {
        self.tracker.lock().begin_connect();
        match self.connector.connect().await {
            Ok(()) => {
                self.tracker.lock().connect_succeeded();
                self.report_success();
                true
            }
            Err(e) => {
                log::warn!("⚠️  {} failed to connect: {}", self.name(), e);
                self.tracker.lock().connect_failed(&e.to_string(), Instant::now());
                self.report_failure(&e);
                false
            }
        }
    }

    async fn poll_once(&self) -> PollOutcome {
        let (state, ready) = {
            let tracker = self.tracker.lock();
            (tracker.state(), tracker.can_attempt(Instant::now()))
        };
        if !ready {
            return PollOutcome::Backoff;
        }
        if state == ConnectorState::Disconnected && !self.connect().await {
            return PollOutcome::Failed;
        }

        match self.connector.poll().await {
            Ok(events) => {
                self.tracker.lock().fetch_succeeded();
                self.report_success();
                PollOutcome::Published(self.publish_batch(events).await)
            }
            Err(e) => {
                self.fetch_failed(&e).await;
                PollOutcome::Failed
            }
        }
    }

    async fn fetch_failed(&self, error: &ConnectorError) {
        log::warn!("⚠️  {} fetch failed: {}", self.name(), error);
        let state = {
            let mut tracker = self.tracker.lock();
            tracker.fetch_failed(&error.to_string(), Instant::now());
            tracker.state()
        };
        self.report_failure(error);
        if state == ConnectorState::Disconnected {
            if let Err(e) = self.connector.disconnect().await {
                log::debug!("{} disconnect after failures: {}", self.name(), e);
            }
        }
    }

    /// Validate, stamp and publish in source order; returns the published count
    async fn publish_batch(&self, events: Vec<StandardEvent>) -> usize {
        let mut published = 0;
        for event in events {
            if self.publish_one(event).await {
                published += 1;
            }
        }
        published
    }

    async fn publish_one(&self, event: StandardEvent) -> bool {
        if let Err(e) = event.validate() {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            log::warn!("⚠️  {} produced an invalid {} event, dropped: {}", self.name(), event.event_type, e);
            return false;
        }
        let stamped = self.clock.lock().stamp(event.timestamp);
        let event = event.with_timestamp(stamped);

        match self.bus.publish(event).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::error!("❌ {} could not publish: {}", self.name(), e);
                false
            }
        }
    }

    async fn run_stream(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let wait_until = self.tracker.lock().next_attempt_at();
            if let Some(at) = wait_until {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = shutdown.changed() => return,
                }
            }

            // Degraded keeps the session; only a Disconnected tracker reconnects
            if self.state() == ConnectorState::Disconnected && !self.connect().await {
                continue;
            }

            let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
            let connector = self.connector.clone();
            let stream = connector.stream(tx);
            tokio::pin!(stream);

            let result = loop {
                tokio::select! {
                    result = &mut stream => break result,
                    Some(event) = rx.recv() => {
                        self.tracker.lock().fetch_succeeded();
                        self.publish_one(event).await;
                    }
                    _ = shutdown.changed() => return,
                }
            };

            // the sender went away with the stream; forward what it left behind
            while let Ok(event) = rx.try_recv() {
                self.publish_one(event).await;
            }

            match result {
                Ok(()) => {
                    log::info!("🔚 {} stream ended", self.name());
                    self.tracker.lock().disconnected();
                    return;
                }
                Err(e @ ConnectorError::Unsupported(..)) => {
                    log::error!("❌ {}", e);
                    self.report_failure(&e);
                    return;
                }
                Err(e) => self.fetch_failed(&e).await,
            }
        }
    }

    fn report_success(&self) {
        if let Some(health) = self.health.lock().as_ref() {
            health.report_success(self.name());
        }
    }

    fn report_failure(&self, error: &ConnectorError) {
        let status = status_for(self.state());
        if let Some(health) = self.health.lock().as_ref() {
            health.report_failure(self.name(), &error.to_string(), status);
        }
    }
}

fn status_for(state: ConnectorState) -> HealthStatus {
    match state {
        ConnectorState::Connected => HealthStatus::Healthy,
        ConnectorState::Connecting | ConnectorState::Degraded => HealthStatus::Degraded,
        ConnectorState::Disconnected => HealthStatus::Unhealthy,
    }
}

pub struct ConnectorDriver {
    state: Arc<DriverState>,
    started: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectorDriver {
    pub fn new(connector: Arc<dyn DataConnector>, bus: Arc<dyn EventBus>, config: TrackerConfig) -> Self {
        let tracker = ConnectionTracker::new(connector.name(), config);
        Self {
            state: Arc::new(DriverState {
                connector,
                bus,
                tracker: Mutex::new(tracker),
                clock: Mutex::new(SourceClock::new()),
                health: Mutex::new(None),
                published: AtomicU64::new(0),
                invalid: AtomicU64::new(0),
            }),
            started: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn connector_name(&self) -> &str {
        self.state.name()
    }

    pub fn mode(&self) -> ConnectorMode {
        self.state.connector.mode()
    }

    pub fn state(&self) -> ConnectorState {
        self.state.state()
    }

    pub async fn connect(&self) -> bool {
        self.state.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.state.tracker.lock().disconnected();
        self.state.connector.disconnect().await
    }

    /// One poll round; errors are absorbed into connector state and health
    pub async fn poll_once(&self) -> PollOutcome {
        self.state.poll_once().await
    }

    pub fn published(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    pub fn invalid_dropped(&self) -> u64 {
        self.state.invalid.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Component for ConnectorDriver {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Connector
    }

    async fn start(&self, ctx: &CoreContext) -> Result<(), CoreError> {
        *self.state.health.lock() = Some(ctx.health.clone());
        self.started.store(true, Ordering::Release);

        // an unreachable source is not fatal; polling keeps retrying
        self.state.connect().await;

        if self.mode() == ConnectorMode::Stream {
            let (tx, rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&self.state).run_stream(rx));
            *self.shutdown.lock() = Some(tx);
            *self.task.lock() = Some(handle);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        self.started.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
        self.disconnect().await?;
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        if !self.started.load(Ordering::Acquire) {
            return HealthReport::with_status(HealthStatus::Stopped, "not started");
        }
        let (state, failures, last_error) = {
            let tracker = self.state.tracker.lock();
            (
                tracker.state(),
                tracker.consecutive_failures(),
                tracker.last_error().map(str::to_string),
            )
        };
        let own = self.state.connector.health().await;
        let status = status_for(state).worst(own.status);
        let detail = format!(
            "{:?}, {} consecutive failures, {} published, {} invalid dropped",
            state,
            failures,
            self.published(),
            self.invalid_dropped()
        );
        HealthReport::with_status(status, detail).with_error(last_error.or(own.last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::local::tests::Recorder;
    use crate::bus::{EventFilter, InProcessBus, Priority};
    use crate::connector::replay::tests::recording;
    use crate::connector::{BuildConnector, ConnectorSettings, JsonlReplayConnector};
    use crate::event::EventType;
    use crate::orchestration::lifecycle::tests::test_context;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Connector that replays a script of poll results
    struct Scripted {
        script: Mutex<VecDeque<Result<Vec<StandardEvent>, ConnectorError>>>,
        connects: AtomicU64,
    }

    #[async_trait]
    impl DataConnector for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn mode(&self) -> ConnectorMode {
            ConnectorMode::Poll
        }

        async fn connect(&self) -> Result<(), ConnectorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError> {
            self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn timeout() -> Result<Vec<StandardEvent>, ConnectorError> {
        Err(ConnectorError::Unreachable("timeout".into()))
    }

    fn ticker(symbol: &str) -> StandardEvent {
        StandardEvent::new(EventType::Ticker, "scripted", symbol, json!({"last": 1.0}))
    }

    fn recorded_bus() -> (Arc<InProcessBus>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let bus = Arc::new(InProcessBus::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        bus.subscribe(
            Arc::new(Recorder {
                name: "sub".into(),
                log: log.clone(),
            }),
            EventFilter::all(),
            Priority::Normal,
        );
        (bus, log)
    }

    fn no_backoff() -> TrackerConfig {
        TrackerConfig {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_failures_degrade_then_recover() {
        let (bus, log) = recorded_bus();
        let connector = Arc::new(Scripted {
            script: Mutex::new(VecDeque::from(vec![timeout(), timeout(), timeout(), Ok(vec![ticker("BTC")])])),
            connects: AtomicU64::new(0),
        });
        let driver = ConnectorDriver::new(connector.clone(), bus, no_backoff());
        assert!(driver.connect().await);

        for _ in 0..3 {
            assert_eq!(driver.poll_once().await, PollOutcome::Failed);
        }
        assert_eq!(driver.state(), ConnectorState::Degraded);

        assert_eq!(driver.poll_once().await, PollOutcome::Published(1));
        assert_eq!(driver.state(), ConnectorState::Connected);
        assert_eq!(*log.lock(), vec!["sub:BTC"]);
    }

    #[tokio::test]
    async fn test_disconnected_driver_reconnects_on_next_poll() {
        let (bus, _) = recorded_bus();
        let script = std::iter::repeat_with(timeout).take(6).collect();
        let connector = Arc::new(Scripted {
            script: Mutex::new(script),
            connects: AtomicU64::new(0),
        });
        let driver = ConnectorDriver::new(connector.clone(), bus, no_backoff());
        driver.connect().await;

        for _ in 0..6 {
            driver.poll_once().await;
        }
        assert_eq!(driver.state(), ConnectorState::Disconnected);

        assert_eq!(driver.poll_once().await, PollOutcome::Published(0));
        assert_eq!(driver.state(), ConnectorState::Connected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backoff_skips_polls() {
        let (bus, _) = recorded_bus();
        let connector = Arc::new(Scripted {
            script: Mutex::new(VecDeque::from(vec![timeout()])),
            connects: AtomicU64::new(0),
        });
        let driver = ConnectorDriver::new(connector, bus, TrackerConfig::default());
        driver.connect().await;

        assert_eq!(driver.poll_once().await, PollOutcome::Failed);
        assert_eq!(driver.poll_once().await, PollOutcome::Backoff);
    }

    #[tokio::test]
    async fn test_invalid_events_dropped_and_timestamps_monotonic() {
        let bus = Arc::new(InProcessBus::new());
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Stamps(Arc<parking_lot::Mutex<Vec<chrono::DateTime<Utc>>>>);

        #[async_trait]
        impl crate::bus::EventHandler for Stamps {
            fn name(&self) -> &str {
                "stamps"
            }

            async fn handle(&self, event: &StandardEvent) -> Result<(), CoreError> {
                self.0.lock().push(event.timestamp);
                Ok(())
            }
        }

        bus.subscribe(Arc::new(Stamps(stamps.clone())), EventFilter::all(), Priority::Normal);

        let now = Utc::now();
        let invalid = StandardEvent::new(EventType::Ticker, "scripted", "", json!({}));
        let batch = vec![
            ticker("A").with_timestamp(now),
            invalid,
            ticker("B").with_timestamp(now - ChronoDuration::seconds(5)),
        ];
        let connector = Arc::new(Scripted {
            script: Mutex::new(VecDeque::from(vec![Ok(batch)])),
            connects: AtomicU64::new(0),
        });
        let driver = ConnectorDriver::new(connector, bus, no_backoff());
        driver.connect().await;

        assert_eq!(driver.poll_once().await, PollOutcome::Published(2));
        assert_eq!(driver.invalid_dropped(), 1);
        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] >= stamps[0]);
    }

    /// Stream connector whose sessions fail per script, then stay open
    struct FlakyStream {
        failures: Mutex<u32>,
        sessions: AtomicU64,
        connects: AtomicU64,
        parked: tokio::sync::Notify,
    }

    impl FlakyStream {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(times),
                sessions: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                parked: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait]
    impl DataConnector for FlakyStream {
        fn name(&self) -> &str {
            "flaky_stream"
        }

        fn mode(&self) -> ConnectorMode {
            ConnectorMode::Stream
        }

        async fn connect(&self) -> Result<(), ConnectorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError> {
            Ok(Vec::new())
        }

        async fn stream(&self, _sink: mpsc::Sender<StandardEvent>) -> Result<(), ConnectorError> {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            let fail = {
                let mut left = self.failures.lock();
                if *left > 0 {
                    *left -= 1;
                    true
                } else {
                    false
                }
            };
            if fail {
                return Err(ConnectorError::Unreachable("reset by peer".into()));
            }
            self.parked.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn run_until_parked(connector: Arc<FlakyStream>) -> ConnectorDriver {
        let ctx = test_context();
        ctx.health.register("flaky_stream", ComponentType::Connector);
        let driver = ConnectorDriver::new(connector.clone(), ctx.bus.clone(), no_backoff());
        driver.start(&ctx).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), connector.parked.notified())
            .await
            .unwrap();
        driver
    }

    #[tokio::test]
    async fn test_single_stream_error_keeps_connection() {
        let connector = FlakyStream::failing(1);
        let driver = run_until_parked(connector.clone()).await;

        assert_eq!(driver.state(), ConnectorState::Connected);
        assert_eq!(connector.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_stream_errors_degrade_before_disconnecting() {
        let connector = FlakyStream::failing(3);
        let driver = run_until_parked(connector.clone()).await;

        assert_eq!(driver.state(), ConnectorState::Degraded);
        assert_eq!(driver.health().await.status, HealthStatus::Degraded);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_errors_past_threshold_reconnect() {
        let connector = FlakyStream::failing(6);
        let driver = run_until_parked(connector.clone()).await;

        // the sixth failure disconnects; the next session starts on a fresh connect
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(driver.state(), ConnectorState::Connected);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_mode_forwards_replay() {
        let ctx = test_context();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        ctx.bus.subscribe(
            Arc::new(Recorder {
                name: "sub".into(),
                log: log.clone(),
            }),
            EventFilter::all(),
            Priority::Normal,
        );

        let file = recording(&["A", "B"]);
        let mut settings = ConnectorSettings::new("replay", JsonlReplayConnector::KIND)
            .with_param("path", json!(file.path().to_str().unwrap()));
        settings.mode = ConnectorMode::Stream;
        let connector = Arc::new(JsonlReplayConnector::build(&settings).unwrap());
        let driver = ConnectorDriver::new(connector, ctx.bus.clone(), no_backoff());
        ctx.health.register("replay", ComponentType::Connector);

        driver.start(&ctx).await.unwrap();
        for _ in 0..50 {
            if log.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        driver.stop().await.unwrap();

        assert_eq!(*log.lock(), vec!["sub:A", "sub:B"]);
        assert_eq!(driver.health().await.status, HealthStatus::Stopped);
    }
}
