use super::{EventQuery, EventRepository};
use crate::error::StorageError;
use crate::event::StandardEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT,
    timestamp_ms INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_symbol_time ON events(symbol, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_events_type_time ON events(event_type, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp_ms);
";

/// SQLite-backed repository
///
/// Each row keeps the indexed envelope fields next to the full event as
/// JSON, so queries filter on columns and rows decode without loss.
pub struct SqliteEventRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventRepository {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Unavailable(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        log::info!("✅ SQLite event store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn build_query(query: &EventQuery) -> (String, Vec<Value>) {
    let mut sql = String::from("SELECT body FROM events WHERE 1 = 1");
    let mut args: Vec<Value> = Vec::new();

    if let Some(symbol) = &query.symbol {
        sql.push_str(" AND symbol = ?");
        args.push(Value::Text(symbol.clone()));
    }
    if !query.event_types.is_empty() {
        let marks = vec!["?"; query.event_types.len()].join(", ");
        sql.push_str(&format!(" AND event_type IN ({})", marks));
        args.extend(query.event_types.iter().map(|t| Value::Text(t.as_str().to_string())));
    }
    if let Some(source) = &query.source {
        sql.push_str(" AND source = ?");
        args.push(Value::Text(source.clone()));
    }
    if let Some(from) = query.from {
        sql.push_str(" AND timestamp_ms >= ?");
        args.push(Value::Integer(from.timestamp_millis()));
    }
    if let Some(to) = query.to {
        sql.push_str(" AND timestamp_ms < ?");
        args.push(Value::Integer(to.timestamp_millis()));
    }
    sql.push_str(" ORDER BY timestamp_ms ASC, rowid ASC");
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Integer(limit as i64));
    }
    (sql, args)
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn save(&self, event: &StandardEvent) -> Result<(), StorageError> {
        let body = serde_json::to_string(event)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO events
             (event_id, correlation_id, event_type, source, symbol, timeframe, timestamp_ms, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.correlation_id,
                event.event_type.as_str(),
                event.source,
                event.symbol,
                event.timeframe.map(|t| t.as_str()),
                event.timestamp.timestamp_millis(),
                body,
            ],
        )?;
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StandardEvent>, StorageError> {
        let (sql, args) = build_query(query);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for body in rows {
            events.push(serde_json::from_str(&body?)?);
        }
        Ok(events)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Timeframe};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn candle(symbol: &str, minute: i64) -> StandardEvent {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        StandardEvent::new(
            EventType::Candle,
            "binance",
            symbol,
            json!({"open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10.0}),
        )
        .with_timeframe(Timeframe::Min1)
        .with_timestamp(base + Duration::minutes(minute))
    }

    #[tokio::test]
    async fn test_save_and_query_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("events.db");
        let repo = SqliteEventRepository::open(&path).unwrap();

        let first = candle("BTCUSDT", 0);
        repo.save(&first).await.unwrap();
        repo.save(&first).await.unwrap();
        repo.save(&candle("BTCUSDT", 5)).await.unwrap();
        repo.save(&candle("ETHUSDT", 1)).await.unwrap();
        assert_eq!(repo.count().unwrap(), 3);

        let btc = repo.query(&EventQuery::symbol("BTCUSDT")).await.unwrap();
        assert_eq!(btc.len(), 2);
        assert_eq!(btc[0], first);

        let window = repo
            .query(&EventQuery::default().between(first.timestamp, first.timestamp + Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);

        let none = repo
            .query(&EventQuery::default().of_types([EventType::Trade]))
            .await
            .unwrap();
        assert!(none.is_empty());

        drop(repo);
        let reopened = SqliteEventRepository::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limit_applies_after_ordering() {
        let repo = SqliteEventRepository::in_memory().unwrap();
        for minute in [3, 1, 2] {
            repo.save(&candle("SOL", minute)).await.unwrap();
        }
        let oldest = repo.query(&EventQuery::symbol("SOL").limit(1)).await.unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].timestamp, candle("SOL", 1).timestamp);
    }
}
