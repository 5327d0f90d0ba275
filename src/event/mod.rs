//! Standard event envelope carried through the whole pipeline
//!
//! Connectors normalize source data into `StandardEvent`s, processors derive
//! new ones from them, storage persists them and the streaming layer forwards
//! them to clients. Events are immutable once built: the bus hands out shared
//! references and never mutates them.

pub mod payload;

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use payload::{
    BusErrorPayload, CandlePayload, ConsensusSignalPayload, PositionChangePayload,
    PositionSnapshotPayload, PositionTransition, ScoreDimensions, SignalDirection, SignalPayload,
    TradePayload, TradeSide, TraderScorePayload,
};

/// Enumerated event tag; `as_str` is the wire name used in channel names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Candle,
    Trade,
    Ticker,
    OrderBook,
    FundingRate,
    OpenInterest,
    Liquidation,
    PositionSnapshot,
    PositionChange,
    TraderScore,
    Signal,
    ConsensusSignal,
    BusError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Candle => "candle",
            EventType::Trade => "trade",
            EventType::Ticker => "ticker",
            EventType::OrderBook => "order_book",
            EventType::FundingRate => "funding_rate",
            EventType::OpenInterest => "open_interest",
            EventType::Liquidation => "liquidation",
            EventType::PositionSnapshot => "position_snapshot",
            EventType::PositionChange => "position_change",
            EventType::TraderScore => "trader_score",
            EventType::Signal => "signal",
            EventType::ConsensusSignal => "consensus_signal",
            EventType::BusError => "bus_error",
        }
    }

    pub fn all() -> [EventType; 13] {
        [
            EventType::Candle,
            EventType::Trade,
            EventType::Ticker,
            EventType::OrderBook,
            EventType::FundingRate,
            EventType::OpenInterest,
            EventType::Liquidation,
            EventType::PositionSnapshot,
            EventType::PositionChange,
            EventType::TraderScore,
            EventType::Signal,
            EventType::ConsensusSignal,
            EventType::BusError,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::all()
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    Sec1,
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Sec1 => "1s",
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
            Timeframe::Week1 => "1w",
            Timeframe::Month1 => "1M",
        }
    }

    /// Nominal length in seconds (a month counts as 30 days)
    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::Sec1 => 1,
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Hour4 => 4 * 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
            Timeframe::Week1 => 7 * 24 * 60 * 60,
            Timeframe::Month1 => 30 * 24 * 60 * 60,
        }
    }

    pub fn all() -> [Timeframe; 9] {
        [
            Timeframe::Sec1,
            Timeframe::Min1,
            Timeframe::Min5,
            Timeframe::Min15,
            Timeframe::Hour1,
            Timeframe::Hour4,
            Timeframe::Day1,
            Timeframe::Week1,
            Timeframe::Month1,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::all()
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTimeframe(s.to_string()))
    }
}

/// Random 128-bit identifier, hex encoded
pub fn new_event_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardEvent {
    pub event_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Processors that derived this event, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<String>,
    pub event_type: EventType,
    pub source: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StandardEvent {
    /// Build a root event; its correlation id is its own event id
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        symbol: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let event_id = new_event_id();
        Self {
            correlation_id: event_id.clone(),
            event_id,
            causation_id: None,
            lineage: Vec::new(),
            event_type,
            source: source.into(),
            symbol: symbol.into(),
            timeframe: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build an event derived from `parent` by the processor `processor`
    ///
    /// Keeps the parent's correlation id, records the parent as cause and
    /// appends the processor to the lineage. Timeframe carries over.
    pub fn derive(
        parent: &StandardEvent,
        processor: &str,
        event_type: EventType,
        symbol: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut lineage = parent.lineage.clone();
        lineage.push(processor.to_string());
        Self {
            event_id: new_event_id(),
            correlation_id: parent.correlation_id.clone(),
            causation_id: Some(parent.event_id.clone()),
            lineage,
            event_type,
            source: processor.to_string(),
            symbol: symbol.into(),
            timeframe: parent.timeframe,
            payload,
            timestamp: Utc::now().max(parent.timestamp),
        }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether `processor` already appears in this event's derivation chain
    pub fn derived_by(&self, processor: &str) -> bool {
        self.lineage.iter().any(|p| p == processor)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ValidationError::InvalidPayload {
            event_type: self.event_type.to_string(),
            reason: e.to_string(),
        })
    }

    /// Check envelope fields and, for event types with a fixed schema, the payload
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.is_empty() {
            return Err(ValidationError::MissingField("event_id"));
        }
        if self.correlation_id.is_empty() {
            return Err(ValidationError::MissingField("correlation_id"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::MissingField("symbol"));
        }
        if !self.payload.is_object() {
            return Err(ValidationError::InvalidPayload {
                event_type: self.event_type.to_string(),
                reason: "payload must be a JSON object".to_string(),
            });
        }

        match self.event_type {
            EventType::Candle => self.payload_as::<CandlePayload>()?.check(),
            EventType::Trade => self.payload_as::<TradePayload>().map(|_| ()),
            EventType::PositionSnapshot => self.payload_as::<PositionSnapshotPayload>()?.check(),
            EventType::PositionChange => self.payload_as::<PositionChangePayload>().map(|_| ()),
            EventType::TraderScore => self.payload_as::<TraderScorePayload>().map(|_| ()),
            EventType::Signal => self.payload_as::<SignalPayload>().map(|_| ()),
            EventType::ConsensusSignal => self.payload_as::<ConsensusSignalPayload>().map(|_| ()),
            EventType::BusError => self.payload_as::<BusErrorPayload>().map(|_| ()),
            _ => Ok(()),
        }
    }
}

/// Keeps timestamps from one source non-decreasing
#[derive(Debug, Default, Clone)]
pub struct SourceClock {
    last: Option<DateTime<Utc>>,
}

impl SourceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let stamped = match self.last {
            Some(last) if timestamp < last => last,
            _ => timestamp,
        };
        self.last = Some(stamped);
        stamped
    }
}
