//! Trader scoring
//!
//! Each position change updates the trader's running stats and produces a
//! `trader_score` event. The score is a weighted sum of four dimensions, each
//! in [0, 1]:
//!
//! - **performance**: cumulative realized pnl through a logistic curve
//! - **size**: largest recent exposure relative to `size_scale`
//! - **recency**: exponential decay of the gap since the previous activity
//! - **regime**: regime tag from the payload, neutral 0.5 when absent
//!
//! How dimensions are computed is pluggable through [`ScoreModel`]; the
//! weights are validated up front so a bad configuration never gets built.

use super::Processor;
use crate::error::{ConfigurationError, ProcessorError};
use crate::event::{EventType, PositionChangePayload, ScoreDimensions, StandardEvent, TraderScorePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const NAME: &str = "trader_scoring";

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub performance: f64,
    pub size: f64,
    pub recency: f64,
    pub regime: f64,
}

impl ScoringWeights {
    pub fn new(performance: f64, size: f64, recency: f64, regime: f64) -> Result<Self, ConfigurationError> {
        let weights = Self {
            performance,
            size,
            recency,
            regime,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in [
            ("performance", self.performance),
            ("size", self.size),
            ("recency", self.recency),
            ("regime", self.regime),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(ConfigurationError::NegativeWeight(name));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigurationError::InvalidWeights { sum });
        }
        Ok(())
    }

    pub fn sum(&self) -> f64 {
        self.performance + self.size + self.recency + self.regime
    }

    pub fn apply(&self, d: &ScoreDimensions) -> f64 {
        self.performance * d.performance + self.size * d.size + self.recency * d.recency + self.regime * d.regime
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            performance: 0.4,
            size: 0.2,
            recency: 0.2,
            regime: 0.2,
        }
    }
}

/// Running stats for one trader
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraderStats {
    pub changes: u64,
    pub realized_pnl: f64,
    /// Largest absolute size seen in the latest change
    pub exposure: f64,
    pub regime: Option<f64>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Activity before `last_activity`, used for recency
    pub previous_activity: Option<DateTime<Utc>>,
}

impl TraderStats {
    pub fn record(&mut self, change: &PositionChangePayload, at: DateTime<Utc>) {
        self.changes += 1;
        if let Some(pnl) = change.realized_pnl {
            self.realized_pnl += pnl;
        }
        self.exposure = change.previous_size.abs().max(change.current_size.abs());
        if change.regime.is_some() {
            self.regime = change.regime;
        }
        self.previous_activity = self.last_activity;
        self.last_activity = Some(at);
    }
}

pub trait ScoreModel: Send {
    fn dimensions(&self, stats: &TraderStats) -> ScoreDimensions;
}

#[derive(Debug, Clone)]
pub struct DefaultScoreModel {
    /// Pnl at which performance reaches ~0.73
    pub pnl_scale: f64,
    /// Exposure that maps to a full size score
    pub size_scale: f64,
    /// Gap after which recency halves
    pub recency_half_life: chrono::Duration,
}

impl Default for DefaultScoreModel {
    fn default() -> Self {
        Self {
            pnl_scale: 1_000.0,
            size_scale: 100.0,
            recency_half_life: chrono::Duration::hours(1),
        }
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl ScoreModel for DefaultScoreModel {
    fn dimensions(&self, stats: &TraderStats) -> ScoreDimensions {
        let performance = 1.0 / (1.0 + (-stats.realized_pnl / self.pnl_scale).exp());
        let size = stats.exposure / self.size_scale;

        let recency = match (stats.previous_activity, stats.last_activity) {
            (Some(prev), Some(last)) => {
                let gap = (last - prev).num_milliseconds().max(0) as f64;
                let half_life = self.recency_half_life.num_milliseconds().max(1) as f64;
                (-std::f64::consts::LN_2 * gap / half_life).exp()
            }
            _ => 1.0,
        };

        ScoreDimensions {
            performance: clamp01(performance),
            size: clamp01(size),
            recency: clamp01(recency),
            regime: clamp01(stats.regime.unwrap_or(0.5)),
        }
    }
}

pub struct TraderScoring {
    weights: ScoringWeights,
    model: Box<dyn ScoreModel>,
    traders: HashMap<String, TraderStats>,
}

impl TraderScoring {
    pub fn new(weights: ScoringWeights) -> Result<Self, ConfigurationError> {
        Self::with_model(weights, Box::new(DefaultScoreModel::default()))
    }

    pub fn with_model(weights: ScoringWeights, model: Box<dyn ScoreModel>) -> Result<Self, ConfigurationError> {
        weights.validate()?;
        Ok(Self {
            weights,
            model,
            traders: HashMap::new(),
        })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn stats(&self, trader: &str) -> Option<&TraderStats> {
        self.traders.get(trader)
    }
}

impl Processor for TraderScoring {
    fn name(&self) -> &str {
        NAME
    }

    fn input_types(&self) -> Vec<EventType> {
        vec![EventType::PositionChange]
    }

    fn process(&mut self, event: &StandardEvent) -> Result<Vec<StandardEvent>, ProcessorError> {
        let change: PositionChangePayload = event.payload_as()?;
        let stats = self.traders.entry(change.trader.clone()).or_default();
        stats.record(&change, event.timestamp);

        let dimensions = self.model.dimensions(stats);
        let score = clamp01(self.weights.apply(&dimensions));
        log::debug!("⚖️  {} scored {:.3} on {}", change.trader, score, event.symbol);

        let payload = serde_json::to_value(TraderScorePayload {
            trader: change.trader,
            score,
            dimensions,
        })
        .map_err(|e| ProcessorError::failed(NAME, e.to_string()))?;

        Ok(vec![StandardEvent::derive(
            event,
            NAME,
            EventType::TraderScore,
            event.symbol.clone(),
            payload,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PositionTransition;
    use chrono::Duration;
    use serde_json::json;

    fn change(trader: &str, prev: f64, curr: f64, pnl: Option<f64>, at: DateTime<Utc>) -> StandardEvent {
        let payload = PositionChangePayload {
            trader: trader.to_string(),
            transition: crate::processor::classify(prev, curr),
            previous_size: prev,
            current_size: curr,
            delta: curr - prev,
            realized_pnl: pnl,
            regime: None,
        };
        StandardEvent::new(
            EventType::PositionChange,
            "position_inference",
            "BTC",
            serde_json::to_value(payload).unwrap(),
        )
        .with_timestamp(at)
    }

    fn score_of(out: &[StandardEvent]) -> TraderScorePayload {
        out[0].payload_as().unwrap()
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(matches!(
            ScoringWeights::new(0.5, 0.3, 0.3, 0.0),
            Err(ConfigurationError::InvalidWeights { .. })
        ));
        assert_eq!(
            ScoringWeights::new(1.2, -0.2, 0.0, 0.0),
            Err(ConfigurationError::NegativeWeight("size"))
        );
        assert!(ScoringWeights::new(0.25, 0.25, 0.25, 0.25).is_ok());
        assert!(ScoringWeights::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_weights_prevent_construction() {
        let weights = ScoringWeights {
            performance: 0.5,
            size: 0.3,
            recency: 0.3,
            regime: 0.0,
        };
        match TraderScoring::new(weights) {
            Err(ConfigurationError::InvalidWeights { sum }) => assert!((sum - 1.1).abs() < 1e-9),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("scoring built with bad weights"),
        }
    }

    #[test]
    fn test_default_model_dimensions() {
        let model = DefaultScoreModel::default();
        let t0 = Utc::now();

        let mut stats = TraderStats::default();
        stats.record(
            &PositionChangePayload {
                trader: "a".to_string(),
                transition: PositionTransition::Opened,
                previous_size: 0.0,
                current_size: 250.0,
                delta: 250.0,
                realized_pnl: None,
                regime: None,
            },
            t0,
        );
        let d = model.dimensions(&stats);
        assert_eq!(d.performance, 0.5);
        assert_eq!(d.size, 1.0);
        assert_eq!(d.recency, 1.0);
        assert_eq!(d.regime, 0.5);

        // an hour-long gap halves recency
        stats.previous_activity = Some(t0);
        stats.last_activity = Some(t0 + Duration::hours(1));
        let d = model.dimensions(&stats);
        assert!((d.recency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_scores_accumulate_per_trader() {
        let mut scoring = TraderScoring::new(ScoringWeights::default()).unwrap();
        let t0 = Utc::now();

        let first = scoring.process(&change("alice", 0.0, 10.0, None, t0)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event_type, EventType::TraderScore);
        assert!(first[0].derived_by(NAME));

        let winning = scoring
            .process(&change("alice", 10.0, 0.0, Some(5_000.0), t0 + Duration::seconds(30)))
            .unwrap();
        let losing = scoring
            .process(&change("bob", 10.0, 0.0, Some(-5_000.0), t0 + Duration::seconds(30)))
            .unwrap();

        let alice = score_of(&winning);
        let bob = score_of(&losing);
        assert!(alice.score > bob.score);
        assert!((0.0..=1.0).contains(&alice.score));
        assert!(alice.dimensions.performance > 0.99);
        assert_eq!(scoring.stats("alice").unwrap().changes, 2);
        assert_eq!(scoring.stats("bob").unwrap().changes, 1);
    }

    struct Flat;

    impl ScoreModel for Flat {
        fn dimensions(&self, _stats: &TraderStats) -> ScoreDimensions {
            ScoreDimensions {
                performance: 1.0,
                size: 0.0,
                recency: 0.0,
                regime: 0.0,
            }
        }
    }

    #[test]
    fn test_pluggable_model() {
        let weights = ScoringWeights::new(0.7, 0.1, 0.1, 0.1).unwrap();
        let mut scoring = TraderScoring::with_model(weights, Box::new(Flat)).unwrap();
        let out = scoring.process(&change("carol", 0.0, 1.0, None, Utc::now())).unwrap();
        assert!((score_of(&out).score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_wrong_payload() {
        let mut scoring = TraderScoring::new(ScoringWeights::default()).unwrap();
        let bad = StandardEvent::new(EventType::PositionChange, "x", "BTC", json!({"trader": "a"}));
        assert!(scoring.process(&bad).is_err());
    }
}
