//! Runtime configuration from environment variables
//!
//! `.env` is loaded by the binary (dotenv); [`CoreConfig::from_env`] then
//! reads `MARKETFLOW_*` variables, falling back to defaults for anything
//! unset. A variable that is set but unparsable is a [`ConfigurationError`],
//! never silently defaulted.
//!
//! Environment variables:
//! - bus: `MARKETFLOW_BUS_BACKEND` (memory | redis), `MARKETFLOW_REDIS_URL`,
//!   `MARKETFLOW_HANDLER_TIMEOUT_MS`, `MARKETFLOW_INSTANCE_ID`
//! - connectors: `MARKETFLOW_CONNECTORS_FILE`, `MARKETFLOW_CONNECTOR_DEGRADE_AFTER`,
//!   `MARKETFLOW_CONNECTOR_DISCONNECT_AFTER`, `MARKETFLOW_CONNECTOR_BACKOFF_MS`,
//!   `MARKETFLOW_CONNECTOR_MAX_BACKOFF_MS`
//! - scheduler: `MARKETFLOW_JOB_MAX_RETRIES`, `MARKETFLOW_JOB_BACKOFF_MS`,
//!   `MARKETFLOW_JOB_MAX_BACKOFF_MS`, `MARKETFLOW_TICK_INTERVAL_MS`,
//!   `MARKETFLOW_FLUSH_INTERVAL_MS`
//! - health: `MARKETFLOW_HEALTH_POLL_MS`, `MARKETFLOW_HEARTBEAT_TIMEOUT_MS`,
//!   `MARKETFLOW_MISSED_HEARTBEATS`
//! - storage: `MARKETFLOW_STORAGE_BACKEND` (memory | sqlite), `MARKETFLOW_DB_PATH`,
//!   `MARKETFLOW_STORAGE_RETRIES`, `MARKETFLOW_STORAGE_BUFFER`, `MARKETFLOW_STORAGE_QUEUE`
//! - streaming: `MARKETFLOW_STREAMING_ENABLED`, `MARKETFLOW_BIND_ADDR`,
//!   `MARKETFLOW_MAX_CONNECTIONS`, `MARKETFLOW_RATE_PER_SEC`, `MARKETFLOW_BURST`,
//!   `MARKETFLOW_MAX_QUEUE_DEPTH`, `MARKETFLOW_SATURATION_INTERVAL_MS`,
//!   `MARKETFLOW_SATURATION_THRESHOLD`, `MARKETFLOW_COMPRESSION_THRESHOLD`
//! - processors: `MARKETFLOW_SCORING_WEIGHTS` (`performance,size,recency,regime`),
//!   `MARKETFLOW_SIGNAL_WINDOW_SECS`, `MARKETFLOW_SIGNAL_MIN_COUNT`
//! - lifecycle: `MARKETFLOW_SHUTDOWN_GRACE_MS`

use crate::connector::{ConnectorSettings, TrackerConfig};
use crate::error::ConfigurationError;
use crate::orchestration::{HealthMonitorConfig, RetryPolicy};
use crate::processor::{ScoringWeights, SignalConfig};
use crate::storage::StorageSinkConfig;
use crate::streaming::StreamingConfig;
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for BusBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "local" => Ok(BusBackend::Memory),
            "redis" => Ok(BusBackend::Redis),
            other => Err(format!("expected memory or redis, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(format!("expected memory or sqlite, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub redis_url: Option<String>,
    /// Time budget for one handler invocation
    pub handler_timeout: Duration,
    pub instance_id: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            redis_url: None,
            handler_timeout: crate::bus::local::DEFAULT_HANDLER_TIMEOUT,
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorsConfig {
    pub file: Option<PathBuf>,
    pub instances: Vec<ConnectorSettings>,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    /// How often processors get a chance to close their windows
    pub tick_interval: Duration,
    /// How often the storage sink retries its backlog
    pub flush_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub db_path: PathBuf,
    pub sink: StorageSinkConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            db_path: PathBuf::from("data/marketflow.db"),
            sink: StorageSinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorsConfig {
    pub weights: ScoringWeights,
    pub signal: SignalConfig,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub shutdown_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub bus: BusConfig,
    pub connectors: ConnectorsConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthMonitorConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub processors: ProcessorsConfig,
    pub lifecycle: LifecycleConfig,
}

/// Typed reads over a variable lookup
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigurationError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            Some(value) => value
                .parse()
                .map_err(|e: T::Err| ConfigurationError::invalid(key, format!("'{}': {}", value, e))),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigurationError> {
        match self.raw(key) {
            Some(_) => Ok(Duration::from_millis(self.parse::<u64>(key, 0)?)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigurationError> {
        match self.raw(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigurationError::invalid(key, format!("'{}' is not a boolean", v))),
        }
    }

    fn weights(&self, key: &str) -> Result<ScoringWeights, ConfigurationError> {
        let Some(value) = self.raw(key) else {
            return Ok(ScoringWeights::default());
        };
        let parts = value
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigurationError::invalid(key, format!("'{}': {}", value, e)))?;
        match parts.as_slice() {
            [performance, size, recency, regime] => ScoringWeights::new(*performance, *size, *recency, *regime),
            _ => Err(ConfigurationError::invalid(
                key,
                format!("expected 4 comma-separated weights, got {}", parts.len()),
            )),
        }
    }
}

impl CoreConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup` instead of the real environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = CoreConfig::default();

        let bus = BusConfig {
            backend: vars.parse("MARKETFLOW_BUS_BACKEND", defaults.bus.backend)?,
            redis_url: vars.raw("MARKETFLOW_REDIS_URL"),
            handler_timeout: vars.millis("MARKETFLOW_HANDLER_TIMEOUT_MS", defaults.bus.handler_timeout)?,
            instance_id: vars.raw("MARKETFLOW_INSTANCE_ID"),
        };

        let tracker = TrackerConfig {
            degrade_after: vars.parse("MARKETFLOW_CONNECTOR_DEGRADE_AFTER", defaults.connectors.tracker.degrade_after)?,
            disconnect_after: vars.parse(
                "MARKETFLOW_CONNECTOR_DISCONNECT_AFTER",
                defaults.connectors.tracker.disconnect_after,
            )?,
            initial_backoff: vars.millis("MARKETFLOW_CONNECTOR_BACKOFF_MS", defaults.connectors.tracker.initial_backoff)?,
            max_backoff: vars.millis("MARKETFLOW_CONNECTOR_MAX_BACKOFF_MS", defaults.connectors.tracker.max_backoff)?,
        };
        let file = vars.raw("MARKETFLOW_CONNECTORS_FILE").map(PathBuf::from);
        let instances = match &file {
            Some(path) => load_connectors(path)?,
            None => Vec::new(),
        };

        let scheduler = SchedulerConfig {
            retry: RetryPolicy {
                max_retries: vars.parse("MARKETFLOW_JOB_MAX_RETRIES", defaults.scheduler.retry.max_retries)?,
                initial_backoff: vars.millis("MARKETFLOW_JOB_BACKOFF_MS", defaults.scheduler.retry.initial_backoff)?,
                max_backoff: vars.millis("MARKETFLOW_JOB_MAX_BACKOFF_MS", defaults.scheduler.retry.max_backoff)?,
            },
            tick_interval: vars.millis("MARKETFLOW_TICK_INTERVAL_MS", defaults.scheduler.tick_interval)?,
            flush_interval: vars.millis("MARKETFLOW_FLUSH_INTERVAL_MS", defaults.scheduler.flush_interval)?,
        };

        let health = HealthMonitorConfig {
            poll_interval: vars.millis("MARKETFLOW_HEALTH_POLL_MS", defaults.health.poll_interval)?,
            heartbeat_timeout: vars.millis("MARKETFLOW_HEARTBEAT_TIMEOUT_MS", defaults.health.heartbeat_timeout)?,
            missed_threshold: vars.parse("MARKETFLOW_MISSED_HEARTBEATS", defaults.health.missed_threshold)?,
        };

        let storage = StorageConfig {
            backend: vars.parse("MARKETFLOW_STORAGE_BACKEND", defaults.storage.backend)?,
            db_path: vars
                .raw("MARKETFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.db_path),
            sink: StorageSinkConfig {
                max_retries: vars.parse("MARKETFLOW_STORAGE_RETRIES", defaults.storage.sink.max_retries)?,
                buffer_capacity: vars.parse("MARKETFLOW_STORAGE_BUFFER", defaults.storage.sink.buffer_capacity)?,
                queue_capacity: vars.parse("MARKETFLOW_STORAGE_QUEUE", defaults.storage.sink.queue_capacity)?,
                ..defaults.storage.sink
            },
        };

        let streaming = StreamingConfig {
            enabled: vars.flag("MARKETFLOW_STREAMING_ENABLED", defaults.streaming.enabled)?,
            bind_addr: vars
                .raw("MARKETFLOW_BIND_ADDR")
                .unwrap_or(defaults.streaming.bind_addr),
            max_connections: vars.parse("MARKETFLOW_MAX_CONNECTIONS", defaults.streaming.max_connections)?,
            rate_per_sec: vars.parse("MARKETFLOW_RATE_PER_SEC", defaults.streaming.rate_per_sec)?,
            burst: vars.parse("MARKETFLOW_BURST", defaults.streaming.burst)?,
            max_queue_depth: vars.parse("MARKETFLOW_MAX_QUEUE_DEPTH", defaults.streaming.max_queue_depth)?,
            saturation_interval: vars.millis("MARKETFLOW_SATURATION_INTERVAL_MS", defaults.streaming.saturation_interval)?,
            saturation_threshold: vars.parse("MARKETFLOW_SATURATION_THRESHOLD", defaults.streaming.saturation_threshold)?,
            compression_threshold: vars.parse(
                "MARKETFLOW_COMPRESSION_THRESHOLD",
                defaults.streaming.compression_threshold,
            )?,
        };

        let processors = ProcessorsConfig {
            weights: vars.weights("MARKETFLOW_SCORING_WEIGHTS")?,
            signal: SignalConfig {
                window: chrono::Duration::seconds(vars.parse(
                    "MARKETFLOW_SIGNAL_WINDOW_SECS",
                    defaults.processors.signal.window.num_seconds(),
                )?),
                min_signals: vars.parse("MARKETFLOW_SIGNAL_MIN_COUNT", defaults.processors.signal.min_signals)?,
            },
        };

        let lifecycle = LifecycleConfig {
            shutdown_grace: vars.millis("MARKETFLOW_SHUTDOWN_GRACE_MS", defaults.lifecycle.shutdown_grace)?,
        };

        let config = Self {
            bus,
            connectors: ConnectorsConfig {
                file,
                instances,
                tracker,
            },
            scheduler,
            health,
            storage,
            streaming,
            processors,
            lifecycle,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks; anything that fails here aborts startup
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.processors.weights.validate()?;

        if self.bus.backend == BusBackend::Redis && self.bus.redis_url.is_none() {
            return Err(ConfigurationError::MissingVariable("MARKETFLOW_REDIS_URL".to_string()));
        }
        if self.bus.handler_timeout.is_zero() {
            return Err(ConfigurationError::invalid("bus.handler_timeout", "must be non-zero"));
        }

        let tracker = &self.connectors.tracker;
        if tracker.degrade_after == 0 || tracker.disconnect_after < tracker.degrade_after {
            return Err(ConfigurationError::invalid(
                "connectors.tracker",
                format!(
                    "need 0 < degrade_after ({}) <= disconnect_after ({})",
                    tracker.degrade_after, tracker.disconnect_after
                ),
            ));
        }

        let mut names = HashSet::new();
        for settings in &self.connectors.instances {
            if !names.insert(settings.name.as_str()) {
                return Err(ConfigurationError::invalid(
                    "connectors",
                    format!("instance name '{}' is used twice", settings.name),
                ));
            }
            if settings.poll_interval_ms == 0 {
                return Err(ConfigurationError::invalid(
                    format!("connectors.{}.poll_interval_ms", settings.name),
                    "must be non-zero",
                ));
            }
        }

        for (key, value) in [
            ("scheduler.tick_interval", self.scheduler.tick_interval),
            ("scheduler.flush_interval", self.scheduler.flush_interval),
            ("health.poll_interval", self.health.poll_interval),
            ("health.heartbeat_timeout", self.health.heartbeat_timeout),
            ("streaming.saturation_interval", self.streaming.saturation_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigurationError::invalid(key, "must be non-zero"));
            }
        }
        if self.health.missed_threshold == 0 {
            return Err(ConfigurationError::invalid("health.missed_threshold", "must be at least 1"));
        }

        let streaming = &self.streaming;
        if !(streaming.rate_per_sec > 0.0) {
            return Err(ConfigurationError::invalid("streaming.rate_per_sec", "must be positive"));
        }
        if streaming.burst == 0 {
            return Err(ConfigurationError::invalid("streaming.burst", "must be at least 1"));
        }
        if streaming.max_queue_depth == 0 {
            return Err(ConfigurationError::invalid("streaming.max_queue_depth", "must be at least 1"));
        }
        if streaming.max_connections == 0 {
            return Err(ConfigurationError::invalid("streaming.max_connections", "must be at least 1"));
        }
        if streaming.saturation_threshold == 0 {
            return Err(ConfigurationError::invalid("streaming.saturation_threshold", "must be at least 1"));
        }

        if self.processors.signal.min_signals == 0 {
            return Err(ConfigurationError::invalid("processors.signal.min_signals", "must be at least 1"));
        }
        if self.processors.signal.window <= chrono::Duration::zero() {
            return Err(ConfigurationError::invalid("processors.signal.window", "must be positive"));
        }
        if self.storage.sink.buffer_capacity == 0 {
            return Err(ConfigurationError::invalid("storage.buffer_capacity", "must be at least 1"));
        }
        if self.storage.sink.queue_capacity == 0 {
            return Err(ConfigurationError::invalid("storage.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

/// Read connector instances from a JSON array file
pub fn load_connectors(path: &Path) -> Result<Vec<ConnectorSettings>, ConfigurationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigurationError::invalid(path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorMode;
    use crate::event::EventType;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CoreConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.db_path, PathBuf::from("data/marketflow.db"));
        assert_eq!(config.connectors.tracker.degrade_after, 3);
        assert_eq!(config.connectors.tracker.disconnect_after, 6);
        assert_eq!(config.processors.weights, ScoringWeights::default());
        assert_eq!(config.lifecycle.shutdown_grace, Duration::from_secs(10));
        assert!(config.connectors.instances.is_empty());
        assert!(config.streaming.enabled);
    }

    #[test]
    fn test_custom_config() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("MARKETFLOW_BUS_BACKEND", "redis"),
            ("MARKETFLOW_REDIS_URL", "redis://127.0.0.1:6379"),
            ("MARKETFLOW_STORAGE_BACKEND", "memory"),
            ("MARKETFLOW_RATE_PER_SEC", "10"),
            ("MARKETFLOW_MAX_QUEUE_DEPTH", "50"),
            ("MARKETFLOW_SCORING_WEIGHTS", "0.25, 0.25, 0.25, 0.25"),
            ("MARKETFLOW_SIGNAL_WINDOW_SECS", "300"),
            ("MARKETFLOW_STREAMING_ENABLED", "false"),
            ("MARKETFLOW_SHUTDOWN_GRACE_MS", "2500"),
        ]))
        .unwrap();

        assert_eq!(config.bus.backend, BusBackend::Redis);
        assert_eq!(config.bus.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.streaming.rate_per_sec, 10.0);
        assert_eq!(config.streaming.max_queue_depth, 50);
        assert_eq!(config.processors.weights.recency, 0.25);
        assert_eq!(config.processors.signal.window, chrono::Duration::seconds(300));
        assert!(!config.streaming.enabled);
        assert_eq!(config.lifecycle.shutdown_grace, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_MAX_QUEUE_DEPTH", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { ref key, .. } if key == "MARKETFLOW_MAX_QUEUE_DEPTH"));

        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_SCORING_WEIGHTS", "0.5,0.3,0.3,0")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidWeights { .. }));

        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_BUS_BACKEND", "redis")])).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingVariable("MARKETFLOW_REDIS_URL".to_string()));

        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_RATE_PER_SEC", "0")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));

        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_STREAMING_ENABLED", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_connectors_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "okx", "kind": "http_poll", "url": "https://example.com/t", "symbols": ["BTC-USDT"],
                  "poll_interval_ms": 1000, "params": {{"symbol_field": "instId"}}}},
                {{"name": "replay", "kind": "jsonl_replay", "mode": "stream", "event_type": "candle",
                  "params": {{"path": "/tmp/x.jsonl"}}}}
            ]"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_CONNECTORS_FILE", path.as_str())])).unwrap();
        let instances = &config.connectors.instances;
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].poll_interval_ms, 1000);
        assert_eq!(instances[0].param_str("symbol_field"), Some("instId"));
        assert_eq!(instances[1].mode, ConnectorMode::Stream);
        assert_eq!(instances[1].event_type, EventType::Candle);

        let missing = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_CONNECTORS_FILE", "/no/such/file.json")]));
        assert!(matches!(missing, Err(ConfigurationError::Unreadable { .. })));
    }

    #[test]
    fn test_duplicate_instance_names_rejected() {
        let mut config = CoreConfig::default();
        config.connectors.instances = vec![
            ConnectorSettings::new("okx", "http_poll"),
            ConnectorSettings::new("okx", "jsonl_replay"),
        ];
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_signal_and_storage_queue_settings() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("MARKETFLOW_SIGNAL_MIN_COUNT", "7"),
            ("MARKETFLOW_STORAGE_QUEUE", "64"),
        ]))
        .unwrap();
        assert_eq!(config.processors.signal.min_signals, 7);
        assert_eq!(config.storage.sink.queue_capacity, 64);

        let err = CoreConfig::from_lookup(lookup(&[("MARKETFLOW_STORAGE_QUEUE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { ref key, .. } if key == "storage.queue_capacity"));
    }
}
