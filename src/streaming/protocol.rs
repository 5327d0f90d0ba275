//! JSON messages exchanged with streaming clients
//!
//! Both directions are tagged with `"type"`.

use super::subscription::{ClientId, SubscriptionFilters};
use crate::event::{EventType, StandardEvent, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        event_types: Vec<EventType>,
        #[serde(default)]
        timeframe: Option<Timeframe>,
        #[serde(default)]
        compression: bool,
    },
    Unsubscribe,
    Ping,
}

impl ClientMessage {
    /// Filters requested by a `subscribe` message
    pub fn filters(&self) -> Option<SubscriptionFilters> {
        match self {
            ClientMessage::Subscribe {
                symbols,
                event_types,
                timeframe,
                ..
            } => Some(SubscriptionFilters {
                symbols: symbols.iter().cloned().collect(),
                event_types: event_types.iter().copied().collect(),
                timeframe: *timeframe,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        client_id: ClientId,
        filters: SubscriptionFilters,
        compression: bool,
    },
    Unsubscribed,
    Event {
        event: StandardEvent,
    },
    Error {
        message: String,
    },
    Pong {
        server_time: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            server_time: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "symbols": ["BTC", "ETH"], "event_types": ["candle"],
                "timeframe": "1h", "compression": true}"#,
        )
        .unwrap();

        let filters = msg.filters().unwrap();
        assert_eq!(filters.symbols.len(), 2);
        assert!(filters.event_types.contains(&EventType::Candle));
        assert_eq!(filters.timeframe, Some(Timeframe::Hour1));
        assert!(matches!(msg, ClientMessage::Subscribe { compression: true, .. }));
    }

    #[test]
    fn test_parse_minimal_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "subscribe"}"#).unwrap();
        assert_eq!(msg.filters(), Some(SubscriptionFilters::default()));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert!(msg.filters().is_none());

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "shout"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "subscribe", "event_types": ["nope"]}"#).is_err());
    }

    #[test]
    fn test_server_messages_are_tagged() {
        let event = StandardEvent::new(EventType::Ticker, "okx", "BTC", json!({"last": 1.0}));
        let value = serde_json::to_value(ServerMessage::Event { event: event.clone() }).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["symbol"], "BTC");

        let value = serde_json::to_value(ServerMessage::error("bad request")).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "bad request"}));

        let value = serde_json::to_value(ServerMessage::Unsubscribed).unwrap();
        assert_eq!(value, json!({"type": "unsubscribed"}));
    }
}
