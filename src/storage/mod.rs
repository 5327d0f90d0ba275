//! Event persistence
//!
//! The core only talks to [`EventRepository`]. Two backends ship with the
//! crate: an in-memory store for tests and single-shot runs, and SQLite for
//! anything that needs to survive a restart. [`StorageSink`] connects a
//! repository to the bus.

pub mod sink;
pub mod sqlite;

use crate::error::StorageError;
use crate::event::{EventType, StandardEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub use sink::{StorageSink, StorageSinkConfig};
pub use sqlite::SqliteEventRepository;

/// Filter for [`EventRepository::query`]
///
/// Every `None` (or empty type list) means "no restriction". The time range
/// is half-open: `from <= timestamp < to`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub symbol: Option<String>,
    pub event_types: Vec<EventType>,
    pub source: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::default()
        }
    }

    pub fn of_types<I: IntoIterator<Item = EventType>>(mut self, types: I) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &StandardEvent) -> bool {
        if let Some(symbol) = &self.symbol {
            if &event.symbol != symbol {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(source) = &self.source {
            if &event.source != source {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp >= to {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Persist one event; saving the same `event_id` twice is a no-op
    async fn save(&self, event: &StandardEvent) -> Result<(), StorageError>;

    /// Matching events ordered by timestamp, oldest first
    async fn query(&self, query: &EventQuery) -> Result<Vec<StandardEvent>, StorageError>;

    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemoryRepository {
    events: RwLock<Vec<StandardEvent>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventRepository for MemoryRepository {
    async fn save(&self, event: &StandardEvent) -> Result<(), StorageError> {
        let mut events = self.events.write();
        if events.iter().any(|e| e.event_id == event.event_id) {
            return Ok(());
        }
        events.push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StandardEvent>, StorageError> {
        let mut found: Vec<StandardEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.timestamp);
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event(event_type: EventType, symbol: &str, offset_secs: i64) -> StandardEvent {
        let base = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        StandardEvent::new(event_type, "test", symbol, json!({})).with_timestamp(base + Duration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn test_memory_repository_filters_and_orders() {
        let repo = MemoryRepository::new();
        let late = event(EventType::Trade, "BTC", 30);
        repo.save(&late).await.unwrap();
        repo.save(&event(EventType::Candle, "BTC", 10)).await.unwrap();
        repo.save(&event(EventType::Trade, "ETH", 20)).await.unwrap();
        repo.save(&event(EventType::Trade, "BTC", 0)).await.unwrap();
        repo.save(&late).await.unwrap();
        assert_eq!(repo.len(), 4);

        let trades = repo
            .query(&EventQuery::symbol("BTC").of_types([EventType::Trade]))
            .await
            .unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades[0].timestamp < trades[1].timestamp);

        let base = late.timestamp - Duration::seconds(30);
        let window = repo
            .query(&EventQuery::default().between(base + Duration::seconds(10), base + Duration::seconds(30)))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);

        let limited = repo.query(&EventQuery::default().limit(1)).await.unwrap();
        assert_eq!(limited[0].timestamp, base);
    }
}
