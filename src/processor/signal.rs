//! Consensus signal generation
//!
//! Votes come from explicit `signal` events (weighted by their strength) and
//! from `position_change` events (direction of the size delta, weighted by the
//! trader's latest score). Votes are grouped per symbol into windows that open
//! with the first vote. A window emits one `consensus_signal` once it holds
//! `min_signals` votes, or when it closes: either a later event lands past its
//! end or `tick` is called after its end.

use super::Processor;
use crate::error::ProcessorError;
use crate::event::{
    ConsensusSignalPayload, EventType, PositionChangePayload, SignalDirection, SignalPayload, StandardEvent,
    TraderScorePayload,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const NAME: &str = "signal_generation";

/// Weight given to traders that have not been scored yet
const UNSCORED_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub window: Duration,
    pub min_signals: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(60),
            min_signals: 3,
        }
    }
}

struct Vote {
    direction: SignalDirection,
    weight: f64,
}

struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    votes: Vec<Vote>,
    /// Last vote, used as the parent of the consensus event
    last: StandardEvent,
}

impl Window {
    fn open(first: &StandardEvent, length: Duration) -> Self {
        Self {
            start: first.timestamp,
            end: first.timestamp + length,
            votes: Vec::new(),
            last: first.clone(),
        }
    }

    fn consensus(&self) -> Option<ConsensusSignalPayload> {
        let mut long_weight = 0.0;
        let mut short_weight = 0.0;
        for vote in &self.votes {
            match vote.direction {
                SignalDirection::Long => long_weight += vote.weight,
                SignalDirection::Short => short_weight += vote.weight,
                SignalDirection::Neutral => {}
            }
        }

        let total = long_weight + short_weight;
        if self.votes.is_empty() || total <= 0.0 {
            return None;
        }

        let (direction, agreeing) = if long_weight > short_weight {
            (SignalDirection::Long, long_weight)
        } else if short_weight > long_weight {
            (SignalDirection::Short, short_weight)
        } else {
            (SignalDirection::Neutral, long_weight)
        };

        Some(ConsensusSignalPayload {
            direction,
            confidence: agreeing / total,
            signal_count: self.votes.len(),
            long_weight,
            short_weight,
            window_start: self.start,
            window_end: self.end,
        })
    }

    fn into_event(self) -> Option<StandardEvent> {
        let consensus = self.consensus()?;
        let payload = serde_json::to_value(&consensus).ok()?;
        log::info!(
            "📣 {} consensus {:?} ({:.0}% of {} votes)",
            self.last.symbol,
            consensus.direction,
            consensus.confidence * 100.0,
            consensus.signal_count
        );
        Some(StandardEvent::derive(
            &self.last,
            NAME,
            EventType::ConsensusSignal,
            self.last.symbol.clone(),
            payload,
        ))
    }
}

pub struct SignalGeneration {
    config: SignalConfig,
    windows: HashMap<String, Window>,
    trader_scores: HashMap<String, f64>,
}

impl SignalGeneration {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            trader_scores: HashMap::new(),
        }
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn trader_weight(&self, trader: &str) -> f64 {
        self.trader_scores.get(trader).copied().unwrap_or(UNSCORED_WEIGHT)
    }

    fn vote_for(&mut self, event: &StandardEvent) -> Result<Option<Vote>, ProcessorError> {
        match event.event_type {
            EventType::TraderScore => {
                let score: TraderScorePayload = event.payload_as()?;
                self.trader_scores.insert(score.trader, score.score);
                Ok(None)
            }
            EventType::Signal => {
                let signal: SignalPayload = event.payload_as()?;
                Ok(Some(Vote {
                    direction: signal.direction,
                    weight: signal.strength.max(0.0),
                }))
            }
            EventType::PositionChange => {
                let change: PositionChangePayload = event.payload_as()?;
                Ok(Some(Vote {
                    direction: SignalDirection::from_size(change.delta),
                    weight: self.trader_weight(&change.trader),
                }))
            }
            other => Err(ProcessorError::failed(NAME, format!("unexpected input {}", other))),
        }
    }
}

impl Default for SignalGeneration {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

impl Processor for SignalGeneration {
    fn name(&self) -> &str {
        NAME
    }

    fn input_types(&self) -> Vec<EventType> {
        vec![EventType::Signal, EventType::PositionChange, EventType::TraderScore]
    }

    fn process(&mut self, event: &StandardEvent) -> Result<Vec<StandardEvent>, ProcessorError> {
        let Some(vote) = self.vote_for(event)? else {
            return Ok(Vec::new());
        };
        if vote.direction == SignalDirection::Neutral {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let symbol = event.symbol.clone();

        let expired = self
            .windows
            .get(&symbol)
            .map(|w| event.timestamp >= w.end)
            .unwrap_or(false);
        if expired {
            if let Some(consensus) = self.windows.remove(&symbol).and_then(Window::into_event) {
                out.push(consensus);
            }
        }

        let length = self.config.window;
        let window = self
            .windows
            .entry(symbol.clone())
            .or_insert_with(|| Window::open(event, length));
        window.votes.push(vote);
        window.last = event.clone();

        if window.votes.len() >= self.config.min_signals {
            if let Some(consensus) = self.windows.remove(&symbol).and_then(Window::into_event) {
                out.push(consensus);
            }
        }
        Ok(out)
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Vec<StandardEvent> {
        let closed: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| now >= w.end)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        closed
            .into_iter()
            .filter_map(|symbol| self.windows.remove(&symbol))
            .filter_map(Window::into_event)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PositionTransition;
    use serde_json::json;

    fn signal(symbol: &str, direction: &str, at: DateTime<Utc>) -> StandardEvent {
        StandardEvent::new(EventType::Signal, "strategy", symbol, json!({"direction": direction})).with_timestamp(at)
    }

    fn score(trader: &str, value: f64) -> StandardEvent {
        StandardEvent::new(
            EventType::TraderScore,
            "trader_scoring",
            "BTC",
            json!({"trader": trader, "score": value,
                   "dimensions": {"performance": 0.0, "size": 0.0, "recency": 0.0, "regime": 0.0}}),
        )
    }

    fn change(trader: &str, delta: f64, at: DateTime<Utc>) -> StandardEvent {
        let payload = PositionChangePayload {
            trader: trader.to_string(),
            transition: PositionTransition::Opened,
            previous_size: 0.0,
            current_size: delta,
            delta,
            realized_pnl: None,
            regime: None,
        };
        StandardEvent::new(EventType::PositionChange, "position_inference", "BTC", serde_json::to_value(payload).unwrap())
            .with_timestamp(at)
    }

    fn consensus(event: &StandardEvent) -> ConsensusSignalPayload {
        assert_eq!(event.event_type, EventType::ConsensusSignal);
        event.payload_as().unwrap()
    }

    fn generator(min_signals: usize) -> SignalGeneration {
        SignalGeneration::new(SignalConfig {
            window: Duration::seconds(60),
            min_signals,
        })
    }

    #[test]
    fn test_emits_when_min_signals_reached() {
        let mut gen = generator(3);
        let t0 = Utc::now();
        assert!(gen.process(&signal("BTC", "long", t0)).unwrap().is_empty());
        assert!(gen.process(&signal("BTC", "long", t0 + Duration::seconds(1))).unwrap().is_empty());
        let out = gen.process(&signal("BTC", "short", t0 + Duration::seconds(2))).unwrap();

        assert_eq!(out.len(), 1);
        let c = consensus(&out[0]);
        assert_eq!(c.direction, SignalDirection::Long);
        assert_eq!(c.signal_count, 3);
        assert!((c.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(c.window_start, t0);
        assert_eq!(c.window_end, t0 + Duration::seconds(60));
        assert!(out[0].derived_by(NAME));
        assert_eq!(gen.open_windows(), 0);
    }

    #[test]
    fn test_symbols_have_separate_windows() {
        let mut gen = generator(2);
        let t0 = Utc::now();
        assert!(gen.process(&signal("BTC", "long", t0)).unwrap().is_empty());
        assert!(gen.process(&signal("ETH", "short", t0)).unwrap().is_empty());
        assert_eq!(gen.open_windows(), 2);

        let out = gen.process(&signal("ETH", "short", t0)).unwrap();
        assert_eq!(out[0].symbol, "ETH");
        assert_eq!(consensus(&out[0]).direction, SignalDirection::Short);
        assert_eq!(gen.open_windows(), 1);
    }

    #[test]
    fn test_late_event_closes_previous_window() {
        let mut gen = generator(10);
        let t0 = Utc::now();
        gen.process(&signal("BTC", "short", t0)).unwrap();
        let out = gen.process(&signal("BTC", "long", t0 + Duration::seconds(61))).unwrap();

        assert_eq!(out.len(), 1);
        let c = consensus(&out[0]);
        assert_eq!(c.direction, SignalDirection::Short);
        assert_eq!(c.signal_count, 1);
        assert_eq!(c.confidence, 1.0);
        // the late vote opened a new window
        assert_eq!(gen.open_windows(), 1);
    }

    #[test]
    fn test_tick_closes_expired_windows_only() {
        let mut gen = generator(10);
        let t0 = Utc::now();
        gen.process(&signal("BTC", "long", t0)).unwrap();
        gen.process(&signal("ETH", "long", t0 + Duration::seconds(30))).unwrap();

        let out = gen.tick(t0 + Duration::seconds(75));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol, "BTC");
        assert_eq!(gen.open_windows(), 1);
        assert!(gen.tick(t0 + Duration::seconds(75)).is_empty());
    }

    #[test]
    fn test_position_changes_weighted_by_trader_score() {
        let mut gen = generator(2);
        let t0 = Utc::now();
        assert!(gen.process(&score("whale", 0.9)).unwrap().is_empty());
        assert!(gen.process(&score("minnow", 0.1)).unwrap().is_empty());
        assert_eq!(gen.trader_weight("nobody"), UNSCORED_WEIGHT);

        gen.process(&change("minnow", 5.0, t0)).unwrap();
        let out = gen.process(&change("whale", -5.0, t0 + Duration::seconds(1))).unwrap();

        let c = consensus(&out[0]);
        assert_eq!(c.direction, SignalDirection::Short);
        assert!((c.short_weight - 0.9).abs() < 1e-9);
        assert!((c.long_weight - 0.1).abs() < 1e-9);
        assert!((c.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_tied_weights_are_neutral() {
        let mut gen = generator(2);
        let t0 = Utc::now();
        gen.process(&signal("SOL", "long", t0)).unwrap();
        let out = gen.process(&signal("SOL", "short", t0)).unwrap();
        let c = consensus(&out[0]);
        assert_eq!(c.direction, SignalDirection::Neutral);
        assert_eq!(c.confidence, 0.5);
    }
}
