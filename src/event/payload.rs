//! Typed payload schemas for event types with a fixed shape

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlePayload {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl CandlePayload {
    pub(crate) fn check(&self) -> Result<(), ValidationError> {
        let prices = [self.open, self.high, self.low, self.close];
        if !prices.iter().all(|p| p.is_finite()) || !self.volume.is_finite() {
            return Err(ValidationError::InvalidPayload {
                event_type: "candle".to_string(),
                reason: "prices and volume must be finite".to_string(),
            });
        }
        let within = |p: f64| p >= self.low && p <= self.high;
        if self.high < self.low || !within(self.open) || !within(self.close) {
            return Err(ValidationError::InvalidPayload {
                event_type: "candle".to_string(),
                reason: format!(
                    "inconsistent OHLC: o={} h={} l={} c={}",
                    self.open, self.high, self.low, self.close
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePayload {
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
}

/// Current position of one trader on one symbol (signed size: long > 0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshotPayload {
    pub trader: String,
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    /// Realized pnl reported by the source, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    /// Market regime tag in [0, 1] reported upstream, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<f64>,
}

impl PositionSnapshotPayload {
    pub(crate) fn check(&self) -> Result<(), ValidationError> {
        if self.trader.trim().is_empty() {
            return Err(ValidationError::MissingField("trader"));
        }
        if !self.size.is_finite() {
            return Err(ValidationError::InvalidPayload {
                event_type: "position_snapshot".to_string(),
                reason: "size must be finite".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTransition {
    Opened,
    Closed,
    Increased,
    Decreased,
    Flipped,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionChangePayload {
    pub trader: String,
    pub transition: PositionTransition,
    pub previous_size: f64,
    pub current_size: f64,
    pub delta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDimensions {
    pub performance: f64,
    pub size: f64,
    pub recency: f64,
    pub regime: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderScorePayload {
    pub trader: String,
    pub score: f64,
    pub dimensions: ScoreDimensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Long,
    Short,
    Neutral,
}

impl SignalDirection {
    /// Direction implied by a signed position size
    pub fn from_size(size: f64) -> Self {
        if size > 0.0 {
            SignalDirection::Long
        } else if size < 0.0 {
            SignalDirection::Short
        } else {
            SignalDirection::Neutral
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            SignalDirection::Long => SignalDirection::Short,
            SignalDirection::Short => SignalDirection::Long,
            SignalDirection::Neutral => SignalDirection::Neutral,
        }
    }
}

fn default_strength() -> f64 {
    1.0
}

/// One individual directional signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub direction: SignalDirection,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSignalPayload {
    pub direction: SignalDirection,
    pub confidence: f64,
    pub signal_count: usize,
    pub long_weight: f64,
    pub short_weight: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusErrorPayload {
    pub handler: String,
    pub failed_event_id: String,
    pub failed_event_type: String,
    pub reason: String,
}
