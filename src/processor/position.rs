//! Position inference: snapshots in, position changes out

use super::Processor;
use crate::error::ProcessorError;
use crate::event::{EventType, PositionChangePayload, PositionSnapshotPayload, PositionTransition, StandardEvent};
use std::collections::HashMap;

pub const NAME: &str = "position_inference";

/// Sizes closer to zero than this count as flat
const FLAT_EPSILON: f64 = 1e-9;

fn is_flat(size: f64) -> bool {
    size.abs() < FLAT_EPSILON
}

/// Classify the move from `previous` to `current` signed size
pub fn classify(previous: f64, current: f64) -> PositionTransition {
    match (is_flat(previous), is_flat(current)) {
        (true, true) => PositionTransition::Unchanged,
        (true, false) => PositionTransition::Opened,
        (false, true) => PositionTransition::Closed,
        (false, false) if previous.signum() != current.signum() => PositionTransition::Flipped,
        (false, false) => {
            let (prev, curr) = (previous.abs(), current.abs());
            if (curr - prev).abs() < FLAT_EPSILON {
                PositionTransition::Unchanged
            } else if curr > prev {
                PositionTransition::Increased
            } else {
                PositionTransition::Decreased
            }
        }
    }
}

/// Tracks the last known size per (trader, symbol); unseen pairs start flat
#[derive(Default)]
pub struct PositionInference {
    positions: HashMap<(String, String), f64>,
}

impl PositionInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size_of(&self, trader: &str, symbol: &str) -> f64 {
        self.positions
            .get(&(trader.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn tracked(&self) -> usize {
        self.positions.len()
    }
}

impl Processor for PositionInference {
    fn name(&self) -> &str {
        NAME
    }

    fn input_types(&self) -> Vec<EventType> {
        vec![EventType::PositionSnapshot]
    }

    fn process(&mut self, event: &StandardEvent) -> Result<Vec<StandardEvent>, ProcessorError> {
        let snapshot: PositionSnapshotPayload = event.payload_as()?;
        let key = (snapshot.trader.clone(), event.symbol.clone());
        let previous = self.positions.get(&key).copied().unwrap_or(0.0);
        let current = snapshot.size;

        if is_flat(current) {
            self.positions.remove(&key);
        } else {
            self.positions.insert(key, current);
        }

        let transition = classify(previous, current);
        if transition == PositionTransition::Unchanged {
            return Ok(Vec::new());
        }

        let change = PositionChangePayload {
            trader: snapshot.trader,
            transition,
            previous_size: previous,
            current_size: current,
            delta: current - previous,
            realized_pnl: snapshot.realized_pnl,
            regime: snapshot.regime,
        };
        let payload = serde_json::to_value(&change).map_err(|e| ProcessorError::failed(NAME, e.to_string()))?;
        Ok(vec![StandardEvent::derive(
            event,
            NAME,
            EventType::PositionChange,
            event.symbol.clone(),
            payload,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(trader: &str, symbol: &str, size: f64) -> StandardEvent {
        StandardEvent::new(
            EventType::PositionSnapshot,
            "hyperliquid",
            symbol,
            json!({"trader": trader, "size": size}),
        )
    }

    fn transition_of(p: &mut PositionInference, trader: &str, size: f64) -> Option<PositionTransition> {
        let out = p.process(&snapshot(trader, "BTC", size)).unwrap();
        out.first()
            .map(|e| e.payload_as::<PositionChangePayload>().unwrap().transition)
    }

    #[test]
    fn test_classification_table() {
        use PositionTransition::*;
        assert_eq!(classify(0.0, 5.0), Opened);
        assert_eq!(classify(5.0, 0.0), Closed);
        assert_eq!(classify(5.0, 8.0), Increased);
        assert_eq!(classify(5.0, 3.0), Decreased);
        assert_eq!(classify(-5.0, -8.0), Increased);
        assert_eq!(classify(5.0, -3.0), Flipped);
        assert_eq!(classify(5.0, 5.0), Unchanged);
        assert_eq!(classify(0.0, 0.0), Unchanged);
    }

    #[test]
    fn test_sequence_per_trader() {
        let mut p = PositionInference::new();
        assert_eq!(transition_of(&mut p, "alice", 5.0), Some(PositionTransition::Opened));
        assert_eq!(transition_of(&mut p, "alice", 5.0), None);
        assert_eq!(transition_of(&mut p, "alice", 8.0), Some(PositionTransition::Increased));
        assert_eq!(transition_of(&mut p, "alice", -3.0), Some(PositionTransition::Flipped));
        assert_eq!(transition_of(&mut p, "alice", 0.0), Some(PositionTransition::Closed));
        assert_eq!(p.tracked(), 0);

        // another trader starts flat regardless of alice's history
        assert_eq!(transition_of(&mut p, "bob", 5.0), Some(PositionTransition::Opened));
        assert_eq!(p.size_of("bob", "BTC"), 5.0);
    }

    #[test]
    fn test_change_carries_lineage_and_deltas() {
        let mut p = PositionInference::new();
        let first = snapshot("alice", "ETH", 5.0);
        p.process(&first).unwrap();
        let second = snapshot("alice", "ETH", 2.0);
        let out = p.process(&second).unwrap();

        let change = &out[0];
        assert_eq!(change.event_type, EventType::PositionChange);
        assert_eq!(change.causation_id.as_deref(), Some(second.event_id.as_str()));
        assert_eq!(change.correlation_id, second.correlation_id);
        assert_eq!(change.lineage, vec![NAME.to_string()]);
        let payload: PositionChangePayload = change.payload_as().unwrap();
        assert_eq!(payload.transition, PositionTransition::Decreased);
        assert_eq!(payload.delta, -3.0);
        assert!(change.validate().is_ok());
    }

    #[test]
    fn test_malformed_snapshot_is_an_error() {
        let mut p = PositionInference::new();
        let bad = StandardEvent::new(EventType::PositionSnapshot, "x", "BTC", json!({"size": "big"}));
        assert!(matches!(p.process(&bad), Err(ProcessorError::Validation(_))));
    }
}
