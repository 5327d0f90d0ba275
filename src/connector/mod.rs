//! Source connectors
//!
//! A [`DataConnector`] knows how to talk to one external source and turn
//! what it returns into [`StandardEvent`]s. Everything around that (state
//! tracking, backoff, validation, timestamp ordering, publishing) lives in
//! the [`ConnectorDriver`] so individual connectors stay small.

pub mod driver;
pub mod http;
pub mod registry;
pub mod replay;

use crate::backoff::ExponentialBackoff;
use crate::error::ConnectorError;
use crate::event::{EventType, StandardEvent};
use crate::orchestration::HealthReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use driver::{ConnectorDriver, PollOutcome};
pub use http::HttpPollConnector;
pub use registry::{BuildConnector, ConnectorRegistry};
pub use replay::JsonlReplayConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorMode {
    #[default]
    Poll,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[async_trait]
pub trait DataConnector: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> ConnectorMode;

    async fn connect(&self) -> Result<(), ConnectorError>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;

    /// Fetch whatever is new since the last poll
    async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError>;

    /// Push events into `sink` until the source ends or fails
    async fn stream(&self, sink: mpsc::Sender<StandardEvent>) -> Result<(), ConnectorError> {
        drop(sink);
        Err(ConnectorError::Unsupported(self.name().to_string(), "stream"))
    }

    /// Source-specific health; the driver combines it with its own view
    async fn health(&self) -> HealthReport {
        HealthReport::healthy()
    }
}

fn default_event_type() -> EventType {
    EventType::Ticker
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

/// One connector instance as listed in the connectors file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSettings {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_event_type")]
    pub event_type: EventType,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub mode: ConnectorMode,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ConnectorSettings {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            url: None,
            symbols: Vec::new(),
            event_type: default_event_type(),
            poll_interval_ms: default_poll_interval_ms(),
            mode: ConnectorMode::default(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Consecutive failures that move Connected to Degraded
    pub degrade_after: u32,
    /// Consecutive failures that move Degraded to Disconnected
    pub disconnect_after: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            degrade_after: 3,
            disconnect_after: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Connection state machine for one connector
///
/// ```text
/// Disconnected -> Connecting -> Connected <-> Degraded -> Disconnected
/// ```
pub struct ConnectionTracker {
    name: String,
    config: TrackerConfig,
    backoff: ExponentialBackoff,
    state: ConnectorState,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
    last_error: Option<String>,
}

impl ConnectionTracker {
    pub fn new(name: impl Into<String>, config: TrackerConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.initial_backoff, config.max_backoff, u32::MAX);
        Self {
            name: name.into(),
            config,
            backoff,
            state: ConnectorState::Disconnected,
            consecutive_failures: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// False while a backoff delay is still running
    pub fn can_attempt(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn begin_connect(&mut self) {
        self.transition(ConnectorState::Connecting);
    }

    pub fn connect_succeeded(&mut self) {
        self.clear_failures();
        self.transition(ConnectorState::Connected);
    }

    pub fn connect_failed(&mut self, error: &str, now: Instant) {
        self.record_failure(error, now);
        self.transition(ConnectorState::Disconnected);
    }

    pub fn fetch_succeeded(&mut self) {
        self.clear_failures();
        if self.state == ConnectorState::Degraded {
            self.transition(ConnectorState::Connected);
        }
    }

    pub fn fetch_failed(&mut self, error: &str, now: Instant) {
        self.record_failure(error, now);
        let failures = self.consecutive_failures;
        match self.state {
            ConnectorState::Connected if failures >= self.config.disconnect_after => {
                self.transition(ConnectorState::Disconnected)
            }
            ConnectorState::Connected if failures >= self.config.degrade_after => {
                self.transition(ConnectorState::Degraded)
            }
            ConnectorState::Degraded if failures >= self.config.disconnect_after => {
                self.transition(ConnectorState::Disconnected)
            }
            _ => {}
        }
    }

    /// Manual disconnect; clears any pending backoff
    pub fn disconnected(&mut self) {
        self.next_attempt_at = None;
        self.transition(ConnectorState::Disconnected);
    }

    fn record_failure(&mut self, error: &str, now: Instant) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        let delay = self.backoff.delay_for(self.consecutive_failures - 1);
        self.next_attempt_at = Some(now + delay);
    }

    fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
        self.next_attempt_at = None;
    }

    fn transition(&mut self, to: ConnectorState) {
        if self.state == to {
            return;
        }
        match to {
            ConnectorState::Connected if self.state == ConnectorState::Degraded => {
                log::info!("✅ {} recovered", self.name)
            }
            ConnectorState::Connected => log::info!("🔌 {} connected", self.name),
            ConnectorState::Degraded => log::warn!(
                "⚠️  {} degraded after {} consecutive failures",
                self.name,
                self.consecutive_failures
            ),
            ConnectorState::Disconnected => log::warn!("🔌 {} disconnected", self.name),
            ConnectorState::Connecting => log::debug!("🔗 {} connecting", self.name),
        }
        self.state = to;
    }
}
