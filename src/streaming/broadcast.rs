//! Fan-out of bus events to connected clients
//!
//! The manager subscribes to the bus at Low priority. For each event it finds
//! the matching subscriptions, serializes the event once, compresses at most
//! once, and pushes the frame into each client's outbox. A full outbox drops
//! the frame for that client only. Clients whose outbox stays saturated for
//! `saturation_threshold` consecutive [`BroadcastManager::check_backpressure`]
//! calls are disconnected.

use super::compression::{Frame, MessageCompressor};
use super::protocol::ServerMessage;
use super::rate_limit::ClientOutbox;
use super::subscription::{ClientId, SubscriptionManager};
use crate::bus::EventHandler;
use crate::error::CoreError;
use crate::event::StandardEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub max_queue_depth: usize,
    pub saturation_threshold: u32,
    pub compression_threshold: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 1000,
            saturation_threshold: 3,
            compression_threshold: super::compression::DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub events: u64,
    pub sent: u64,
    pub dropped: u64,
    pub disconnected: u64,
    pub clients: usize,
}

struct ClientEntry {
    outbox: Arc<ClientOutbox>,
    saturated_checks: AtomicU32,
}

pub struct BroadcastManager {
    subscriptions: Arc<SubscriptionManager>,
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    compressor: MessageCompressor,
    config: BroadcastConfig,
    events: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

impl BroadcastManager {
    pub fn new(subscriptions: Arc<SubscriptionManager>, config: BroadcastConfig) -> Self {
        Self {
            subscriptions,
            clients: RwLock::new(HashMap::new()),
            compressor: MessageCompressor::new(config.compression_threshold),
            config,
            events: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Attach a client and hand back the outbox its writer drains
    pub fn register_client(&self, client_id: ClientId) -> Arc<ClientOutbox> {
        let outbox = Arc::new(ClientOutbox::new(self.config.max_queue_depth));
        let previous = self.clients.write().insert(
            client_id,
            ClientEntry {
                outbox: outbox.clone(),
                saturated_checks: AtomicU32::new(0),
            },
        );
        if let Some(old) = previous {
            old.outbox.close();
        }
        outbox
    }

    /// Detach a client, drop its subscription and close its outbox
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        self.subscriptions.unsubscribe(client_id);
        match self.clients.write().remove(&client_id) {
            Some(entry) => {
                entry.outbox.close();
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn outbox(&self, client_id: ClientId) -> Option<Arc<ClientOutbox>> {
        self.clients.read().get(&client_id).map(|e| e.outbox.clone())
    }

    /// Queue a direct reply for one client (never compressed)
    pub fn send_to(&self, client_id: ClientId, message: &ServerMessage) -> bool {
        let Some(outbox) = self.outbox(client_id) else {
            return false;
        };
        match message.to_json() {
            Ok(json) => outbox.push(Frame::Text(json)),
            Err(e) => {
                log::warn!("⚠️  failed to encode reply for client {}: {}", client_id, e);
                false
            }
        }
    }

    /// Push `event` to every matching client; returns how many accepted it
    pub fn broadcast(&self, event: &StandardEvent) -> usize {
        self.events.fetch_add(1, Ordering::Relaxed);
        let targets = self.subscriptions.matching(event);
        if targets.is_empty() {
            return 0;
        }

        let json = match (ServerMessage::Event { event: event.clone() }).to_json() {
            Ok(json) => json,
            Err(e) => {
                log::warn!("⚠️  failed to encode event {}: {}", event.event_id, e);
                return 0;
            }
        };
        let plain = Frame::Text(json.clone());
        let mut compressed: Option<Frame> = None;

        let clients = self.clients.read();
        let mut accepted = 0;
        for subscription in targets {
            let Some(entry) = clients.get(&subscription.client_id) else {
                continue;
            };
            let frame = if subscription.compression {
                compressed
                    .get_or_insert_with(|| self.compressor.encode(json.clone(), true))
                    .clone()
            } else {
                plain.clone()
            };

            if entry.outbox.push(frame) {
                accepted += 1;
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("🐢 client {} outbox full, dropped {}", subscription.client_id, event.event_id);
            }
        }
        self.sent.fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    /// Disconnect clients saturated for too many consecutive checks
    pub fn check_backpressure(&self) -> Vec<ClientId> {
        let mut evict = Vec::new();
        for (id, entry) in self.clients.read().iter() {
            if entry.outbox.is_saturated() {
                let checks = entry.saturated_checks.fetch_add(1, Ordering::Relaxed) + 1;
                if checks >= self.config.saturation_threshold {
                    evict.push(*id);
                }
            } else {
                entry.saturated_checks.store(0, Ordering::Relaxed);
            }
        }

        for id in &evict {
            if self.remove_client(*id) {
                self.disconnected.fetch_add(1, Ordering::Relaxed);
                log::warn!("🐢 disconnecting slow client {} (outbox saturated)", id);
            }
        }
        evict
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events: self.events.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            clients: self.client_count(),
        }
    }

    /// Close every outbox so writer tasks finish
    pub fn close_all(&self) {
        let ids: Vec<ClientId> = self.clients.read().keys().copied().collect();
        for id in ids {
            self.remove_client(id);
        }
    }
}

#[async_trait]
impl EventHandler for BroadcastManager {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn handle(&self, event: &StandardEvent) -> Result<(), CoreError> {
        self.broadcast(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::streaming::compression::decompress;
    use crate::streaming::subscription::SubscriptionFilters;
    use serde_json::json;

    fn manager(depth: usize, threshold: u32) -> BroadcastManager {
        BroadcastManager::new(
            Arc::new(SubscriptionManager::new()),
            BroadcastConfig {
                max_queue_depth: depth,
                saturation_threshold: threshold,
                compression_threshold: 64,
            },
        )
    }

    fn ticker(symbol: &str) -> StandardEvent {
        StandardEvent::new(EventType::Ticker, "okx", symbol, json!({"last": 65000.0, "note": "x".repeat(200)}))
    }

    fn decode(frame: Frame) -> ServerMessage {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Compressed(bytes) => decompress(&bytes).unwrap(),
        };
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_routes_by_subscription_and_compression() {
        let m = manager(10, 3);
        let plain = m.register_client(1);
        let zipped = m.register_client(2);
        let other = m.register_client(3);
        m.subscriptions().subscribe(1, SubscriptionFilters::new(["BTC"], []), false);
        m.subscriptions().subscribe(2, SubscriptionFilters::default(), true);
        m.subscriptions().subscribe(3, SubscriptionFilters::new(["ETH"], []), false);

        let event = ticker("BTC");
        assert_eq!(m.broadcast(&event), 2);
        assert!(other.is_empty());

        let frame = plain.try_pop().unwrap();
        assert!(!frame.is_compressed());
        let frame = zipped.try_pop().unwrap();
        assert!(frame.is_compressed());
        match decode(frame) {
            ServerMessage::Event { event: got } => assert_eq!(got, event),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_subscription_is_ignored() {
        let m = manager(10, 3);
        m.subscriptions().subscribe(9, SubscriptionFilters::default(), false);
        assert_eq!(m.broadcast(&ticker("BTC")), 0);
    }

    #[test]
    fn test_full_outbox_drops_and_backpressure_evicts() {
        let m = manager(2, 2);
        let slow = m.register_client(1);
        let fast = m.register_client(2);
        m.subscriptions().subscribe(1, SubscriptionFilters::default(), false);
        m.subscriptions().subscribe(2, SubscriptionFilters::default(), false);

        for _ in 0..5 {
            m.broadcast(&ticker("BTC"));
            fast.try_pop();
        }
        assert_eq!(slow.len(), 2);
        assert_eq!(slow.dropped(), 3);
        assert_eq!(m.stats().dropped, 3);

        assert!(m.check_backpressure().is_empty());
        assert_eq!(m.check_backpressure(), vec![1]);
        assert!(slow.is_closed());
        assert_eq!(m.client_count(), 1);
        assert!(m.subscriptions().get(1).is_none());
        assert_eq!(m.stats().disconnected, 1);
    }

    #[test]
    fn test_draining_resets_saturation() {
        let m = manager(1, 2);
        let outbox = m.register_client(1);
        m.subscriptions().subscribe(1, SubscriptionFilters::default(), false);

        m.broadcast(&ticker("BTC"));
        assert!(m.check_backpressure().is_empty());
        outbox.try_pop();
        assert!(m.check_backpressure().is_empty());
        m.broadcast(&ticker("BTC"));
        assert!(m.check_backpressure().is_empty());
        assert_eq!(m.client_count(), 1);
    }

    #[test]
    fn test_send_to_and_remove() {
        let m = manager(4, 3);
        let outbox = m.register_client(5);
        assert!(m.send_to(5, &ServerMessage::Unsubscribed));
        assert_eq!(decode(outbox.try_pop().unwrap()), ServerMessage::Unsubscribed);

        assert!(m.remove_client(5));
        assert!(!m.remove_client(5));
        assert!(!m.send_to(5, &ServerMessage::pong()));
    }
}
