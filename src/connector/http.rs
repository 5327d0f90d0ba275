//! Generic JSON-over-HTTP polling connector
//!
//! Each poll GETs the configured URL and maps the response (one object, or
//! an array of objects) to events of the configured type. The symbol comes
//! from `params.symbol_field` when set, otherwise from the single configured
//! symbol. A numeric `timestamp` field (epoch milliseconds) on an item is
//! used as the event time.
//!
//! ```json
//! {"name": "okx", "kind": "http_poll", "url": "https://...",
//!  "event_type": "ticker", "symbols": ["BTC-USDT"],
//!  "params": {"symbol_field": "instId", "timeout_ms": 5000}}
//! ```

use super::registry::BuildConnector;
use super::{ConnectorMode, ConnectorSettings, DataConnector};
use crate::error::{ConnectorError, DataFetchError};
use crate::event::{EventType, StandardEvent};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub struct HttpPollConnector {
    name: String,
    url: String,
    event_type: EventType,
    symbols: Vec<String>,
    symbol_field: Option<String>,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpPollConnector {
    pub const KIND: &'static str = "http_poll";

    /// Turn a decoded response body into events
    pub fn map_response(&self, body: &Value) -> Result<Vec<StandardEvent>, ConnectorError> {
        let items: Vec<&Value> = match body {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![body],
            other => {
                return Err(ConnectorError::Malformed(format!(
                    "expected object or array, got {}",
                    json_kind(other)
                )))
            }
        };

        let mut events = Vec::with_capacity(items.len());
        for item in items {
            if !item.is_object() {
                return Err(ConnectorError::Malformed(format!(
                    "array item is {}, expected object",
                    json_kind(item)
                )));
            }

            let symbol = match &self.symbol_field {
                Some(field) => match item.get(field).and_then(Value::as_str) {
                    Some(s) => s.to_string(),
                    None => {
                        log::debug!("⚠️  {}: item without '{}' skipped", self.name, field);
                        continue;
                    }
                },
                None => match self.symbols.first() {
                    Some(s) => s.clone(),
                    None => {
                        return Err(ConnectorError::InvalidSettings(format!(
                            "{}: no symbol_field and no symbols configured",
                            self.name
                        )))
                    }
                },
            };

            if self.symbol_field.is_some() && !self.symbols.is_empty() && !self.symbols.contains(&symbol) {
                continue;
            }

            let mut event = StandardEvent::new(self.event_type, self.name.clone(), symbol, item.clone());
            if let Some(ts) = item
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            {
                event = event.with_timestamp(ts);
            }
            events.push(event);
        }
        Ok(events)
    }

    fn fetch_error(&self, message: impl std::fmt::Display) -> ConnectorError {
        ConnectorError::DataFetch(DataFetchError::new(self.name.clone(), message.to_string()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl BuildConnector for HttpPollConnector {
    fn build(settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| ConnectorError::InvalidSettings(format!("{}: url is required", settings.name)))?;
        let timeout = Duration::from_millis(settings.param_u64("timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::InvalidSettings(format!("{}: {}", settings.name, e)))?;

        Ok(Self {
            name: settings.name.clone(),
            url,
            event_type: settings.event_type,
            symbols: settings.symbols.clone(),
            symbol_field: settings.param_str("symbol_field").map(str::to_string),
            client,
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DataConnector for HttpPollConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::Poll
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        // HTTP has no session; the first poll is the real reachability check
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<StandardEvent>, ConnectorError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ConnectorError::NotConnected(self.name.clone()));
        }

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_connect() {
                ConnectorError::Unreachable(format!("{}: {}", self.url, e))
            } else {
                self.fetch_error(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(self.fetch_error(format!("HTTP {}", response.status())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Malformed(format!("{}: {}", self.name, e)))?;

        self.map_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connector(symbol_field: Option<&str>, symbols: &[&str]) -> HttpPollConnector {
        let mut settings = ConnectorSettings::new("okx", HttpPollConnector::KIND);
        settings.url = Some("http://127.0.0.1:9/tickers".to_string());
        settings.symbols = symbols.iter().map(|s| s.to_string()).collect();
        if let Some(field) = symbol_field {
            settings = settings.with_param("symbol_field", json!(field));
        }
        HttpPollConnector::build(&settings).unwrap()
    }

    #[test]
    fn test_maps_array_with_symbol_field_and_filter() {
        let c = connector(Some("instId"), &["BTC-USDT"]);
        let body = json!([
            {"instId": "BTC-USDT", "last": "65000", "timestamp": 1714521600000i64},
            {"instId": "ETH-USDT", "last": "3000"},
            {"last": "1"}
        ]);

        let events = c.map_response(&body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTC-USDT");
        assert_eq!(events[0].source, "okx");
        assert_eq!(events[0].event_type, EventType::Ticker);
        assert_eq!(events[0].timestamp.timestamp_millis(), 1714521600000);
    }

    #[test]
    fn test_single_object_uses_configured_symbol() {
        let c = connector(None, &["SOLUSDT"]);
        let events = c.map_response(&json!({"price": 150.2})).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "SOLUSDT");
    }

    #[test]
    fn test_rejects_malformed_bodies() {
        let c = connector(Some("s"), &[]);
        assert!(matches!(c.map_response(&json!("oops")), Err(ConnectorError::Malformed(_))));
        assert!(matches!(c.map_response(&json!([1, 2])), Err(ConnectorError::Malformed(_))));

        let no_symbol = connector(None, &[]);
        assert!(matches!(
            no_symbol.map_response(&json!({})),
            Err(ConnectorError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_build_requires_url() {
        let settings = ConnectorSettings::new("bad", HttpPollConnector::KIND);
        assert!(matches!(
            HttpPollConnector::build(&settings),
            Err(ConnectorError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_before_connect_fails() {
        let c = connector(None, &["X"]);
        assert!(matches!(c.poll().await, Err(ConnectorError::NotConnected(_))));
    }

    #[tokio::test]
    #[ignore] // hits the network
    async fn test_live_poll() {
        let mut settings = ConnectorSettings::new("binance", HttpPollConnector::KIND);
        settings.url = Some("https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT".to_string());
        settings = settings.with_param("symbol_field", json!("symbol"));
        let c = HttpPollConnector::build(&settings).unwrap();
        c.connect().await.unwrap();
        let events = c.poll().await.unwrap();
        assert_eq!(events[0].symbol, "BTCUSDT");
    }
}
