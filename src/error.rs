//! Error taxonomy for the event backbone
//!
//! Every subsystem returns its own error type; `CoreError` folds them together
//! for the places that cross subsystem boundaries (bus handlers, jobs,
//! lifecycle components).

use thiserror::Error;

/// Recoverable failure while fetching data from a source
#[derive(Debug, Clone, Error)]
#[error("fetch from {source_name} failed: {message}")]
pub struct DataFetchError {
    pub source_name: String,
    pub message: String,
}

impl DataFetchError {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    DataFetch(#[from] DataFetchError),

    #[error("connector '{0}' is not connected")]
    NotConnected(String),

    #[error("connector '{0}' does not support {1} mode")]
    Unsupported(String, &'static str),

    #[error("invalid connector settings: {0}")]
    InvalidSettings(String),
}

impl ConnectorError {
    /// Whether the driver should keep retrying after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Unreachable(_)
                | ConnectorError::DataFetch(_)
                | ConnectorError::NotConnected(_)
                | ConnectorError::Malformed(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("event bus is stopped")]
    Stopped,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl From<redis::RedisError> for EventBusError {
    fn from(err: redis::RedisError) -> Self {
        EventBusError::Broker(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("payload for {event_type} is invalid: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("scoring weights must sum to 1.0 (got {sum:.4})")]
    InvalidWeights { sum: f64 },

    #[error("scoring weight '{0}' must be non-negative")]
    NegativeWeight(&'static str),

    #[error("connector name '{0}' is already bound to a different implementation")]
    DuplicateConnector(String),

    #[error("unknown connector kind '{0}'")]
    UnknownConnectorKind(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing environment variable: {0}")]
    MissingVariable(String),

    #[error("failed to read {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::Serialization(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor '{processor}' failed: {reason}")]
    Failed { processor: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ProcessorError {
    pub fn failed(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        ProcessorError::Failed {
            processor: processor.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("scheduler is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("component '{component}' failed to start: {source}")]
    Startup {
        component: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn other(msg: impl Into<String>) -> Self {
        CoreError::Other(msg.into())
    }

    /// Configuration errors abort startup; everything else is contained
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Configuration(_) | CoreError::Startup { .. } => true,
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
