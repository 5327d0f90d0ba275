//! Per-client subscription filters

use crate::event::{EventType, StandardEvent, Timeframe};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type ClientId = u64;

/// Empty symbol or type sets mean "everything"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilters {
    #[serde(default)]
    pub symbols: HashSet<String>,
    #[serde(default)]
    pub event_types: HashSet<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
}

impl SubscriptionFilters {
    pub fn new<S, T>(symbols: S, event_types: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        T: IntoIterator<Item = EventType>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            event_types: event_types.into_iter().collect(),
            timeframe: None,
        }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub client_id: ClientId,
    pub filters: SubscriptionFilters,
    pub compression: bool,
    pub created_at: DateTime<Utc>,
}

pub fn matches(event: &StandardEvent, subscription: &Subscription) -> bool {
    let filters = &subscription.filters;
    if !filters.symbols.is_empty() && !filters.symbols.contains(&event.symbol) {
        return false;
    }
    if !filters.event_types.is_empty() && !filters.event_types.contains(&event.event_type) {
        return false;
    }
    match filters.timeframe {
        Some(wanted) => event.timeframe == Some(wanted),
        None => true,
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<ClientId, Subscription>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the client's subscription
    pub fn subscribe(&self, client_id: ClientId, filters: SubscriptionFilters, compression: bool) -> Subscription {
        let subscription = Subscription {
            client_id,
            filters,
            compression,
            created_at: Utc::now(),
        };
        let replaced = self
            .subscriptions
            .write()
            .insert(client_id, subscription.clone())
            .is_some();
        log::debug!(
            "🔔 client {} {} ({} symbols, {} types)",
            client_id,
            if replaced { "resubscribed" } else { "subscribed" },
            subscription.filters.symbols.len(),
            subscription.filters.event_types.len()
        );
        subscription
    }

    pub fn unsubscribe(&self, client_id: ClientId) -> bool {
        self.subscriptions.write().remove(&client_id).is_some()
    }

    pub fn get(&self, client_id: ClientId) -> Option<Subscription> {
        self.subscriptions.read().get(&client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Subscriptions that want `event`, ordered by client id
    pub fn matching(&self, event: &StandardEvent) -> Vec<Subscription> {
        let mut found: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| matches(event, s))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.client_id);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candle(symbol: &str, timeframe: Option<Timeframe>) -> StandardEvent {
        let event = StandardEvent::new(
            EventType::Candle,
            "okx",
            symbol,
            json!({"open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5}),
        );
        match timeframe {
            Some(tf) => event.with_timeframe(tf),
            None => event,
        }
    }

    fn sub(filters: SubscriptionFilters) -> Subscription {
        Subscription {
            client_id: 1,
            filters,
            compression: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_filters_are_wildcards() {
        let everything = sub(SubscriptionFilters::default());
        assert!(matches(&candle("BTC", None), &everything));
        assert!(matches(&candle("ETH", Some(Timeframe::Hour1)), &everything));
    }

    #[test]
    fn test_symbol_type_and_timeframe_filters() {
        let btc_candles = sub(SubscriptionFilters::new(["BTC"], [EventType::Candle]));
        assert!(matches(&candle("BTC", None), &btc_candles));
        assert!(!matches(&candle("ETH", None), &btc_candles));

        let trade = StandardEvent::new(EventType::Trade, "okx", "BTC", json!({}));
        assert!(!matches(&trade, &btc_candles));

        let hourly = sub(SubscriptionFilters::new(["BTC"], []).with_timeframe(Timeframe::Hour1));
        assert!(matches(&candle("BTC", Some(Timeframe::Hour1)), &hourly));
        assert!(!matches(&candle("BTC", Some(Timeframe::Min1)), &hourly));
        assert!(!matches(&candle("BTC", None), &hourly));
    }

    #[test]
    fn test_manager_replaces_and_removes() {
        let manager = SubscriptionManager::new();
        manager.subscribe(7, SubscriptionFilters::new(["BTC"], []), false);
        manager.subscribe(3, SubscriptionFilters::default(), true);
        manager.subscribe(7, SubscriptionFilters::new(["ETH"], []), true);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(7).unwrap().compression);

        let ids: Vec<ClientId> = manager.matching(&candle("ETH", None)).iter().map(|s| s.client_id).collect();
        assert_eq!(ids, vec![3, 7]);
        let ids: Vec<ClientId> = manager.matching(&candle("BTC", None)).iter().map(|s| s.client_id).collect();
        assert_eq!(ids, vec![3]);

        assert!(manager.unsubscribe(7));
        assert!(!manager.unsubscribe(7));
        assert!(manager.get(7).is_none());
    }
}
