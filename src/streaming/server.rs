//! WebSocket front end for the broadcaster
//!
//! One acceptor task, then two tasks per connection: a reader handling
//! subscribe/unsubscribe/ping/close, and a writer draining the client's
//! outbox at the pace its token bucket allows. A separate loop runs the
//! backpressure check. Everything stops on the shared watch channel.

use super::broadcast::{BroadcastConfig, BroadcastManager};
use super::compression::Frame;
use super::protocol::{ClientMessage, ServerMessage};
use super::rate_limit::{ClientOutbox, TokenBucket};
use super::subscription::{ClientId, SubscriptionManager};
use crate::bus::{EventBus, EventFilter, Priority, SubscriptionHandle};
use crate::error::CoreError;
use crate::orchestration::{Component, ComponentType, CoreContext, HealthReport, HealthStatus};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub max_connections: usize,
    pub rate_per_sec: f64,
    pub burst: u32,
    pub max_queue_depth: usize,
    pub saturation_interval: Duration,
    pub saturation_threshold: u32,
    pub compression_threshold: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:8765".to_string(),
            max_connections: 1000,
            rate_per_sec: 100.0,
            burst: 100,
            max_queue_depth: 1000,
            saturation_interval: Duration::from_secs(1),
            saturation_threshold: 5,
            compression_threshold: super::compression::DEFAULT_THRESHOLD,
        }
    }
}

impl StreamingConfig {
    fn broadcast(&self) -> BroadcastConfig {
        BroadcastConfig {
            max_queue_depth: self.max_queue_depth,
            saturation_threshold: self.saturation_threshold,
            compression_threshold: self.compression_threshold,
        }
    }
}

struct Shared {
    config: StreamingConfig,
    broadcast: Arc<BroadcastManager>,
    next_client: AtomicU64,
    active: AtomicUsize,
    rejected: AtomicU64,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    bus: Arc<dyn EventBus>,
    subscription: SubscriptionHandle,
}

pub struct StreamingServer {
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
}

impl StreamingServer {
    pub fn new(config: StreamingConfig) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new());
        let broadcast = Arc::new(BroadcastManager::new(subscriptions, config.broadcast()));
        Self {
            shared: Arc::new(Shared {
                config,
                broadcast,
                next_client: AtomicU64::new(1),
                active: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
            }),
            local_addr: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.shared.broadcast
    }

    /// Bound address once started (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if shared.active.load(Ordering::Acquire) >= shared.config.max_connections {
                        shared.rejected.fetch_add(1, Ordering::Relaxed);
                        log::warn!("⚠️  rejecting {}: max_connections ({}) reached", addr, shared.config.max_connections);
                        drop(stream);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    shared.active.fetch_add(1, Ordering::AcqRel);
                    tokio::spawn(serve_connection(shared.clone(), stream, addr, shutdown.clone()));
                }
                Err(e) => log::warn!("⚠️  accept error: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("🔌 streaming acceptor stopped");
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("⚠️  websocket handshake with {} failed: {}", addr, e);
            shared.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
    };

    let client_id = shared.next_client.fetch_add(1, Ordering::Relaxed);
    let outbox = shared.broadcast.register_client(client_id);
    log::info!("🔌 client {} connected from {}", client_id, addr);

    let (sink, mut read) = ws.split();
    let bucket = TokenBucket::new(shared.config.rate_per_sec, shared.config.burst);
    let writer = tokio::spawn(write_loop(sink, outbox, bucket));

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_client_text(&shared.broadcast, client_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("client {} read error: {}", client_id, e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    // closing the outbox lets the writer flush what is queued and exit
    shared.broadcast.remove_client(client_id);
    let _ = writer.await;
    shared.active.fetch_sub(1, Ordering::AcqRel);
    log::info!("🔌 client {} disconnected", client_id);
}

fn handle_client_text(broadcast: &BroadcastManager, client_id: ClientId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            broadcast.send_to(client_id, &ServerMessage::error(format!("invalid message: {}", e)));
            return;
        }
    };

    let reply = match &message {
        ClientMessage::Subscribe { compression, .. } => {
            let filters = message.filters().unwrap_or_default();
            let subscription = broadcast.subscriptions().subscribe(client_id, filters, *compression);
            ServerMessage::Subscribed {
                client_id,
                filters: subscription.filters,
                compression: subscription.compression,
            }
        }
        ClientMessage::Unsubscribe => {
            broadcast.subscriptions().unsubscribe(client_id);
            ServerMessage::Unsubscribed
        }
        ClientMessage::Ping => ServerMessage::pong(),
    };
    broadcast.send_to(client_id, &reply);
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    outbox: Arc<ClientOutbox>,
    mut bucket: TokenBucket,
) {
    while let Some(frame) = outbox.recv().await {
        while !bucket.try_acquire() {
            tokio::time::sleep(bucket.time_until_available(Instant::now())).await;
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Compressed(bytes) => Message::Binary(bytes),
        };
        if sink.send(message).await.is_err() {
            outbox.close();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn backpressure_loop(broadcast: Arc<BroadcastManager>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                broadcast.check_backpressure();
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[async_trait]
impl Component for StreamingServer {
    fn name(&self) -> &str {
        "streaming"
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Streaming
    }

    async fn start(&self, ctx: &CoreContext) -> Result<(), CoreError> {
        if self.running.lock().is_some() {
            return Err(CoreError::other("streaming server already started"));
        }

        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        let subscription = ctx
            .bus
            .subscribe(self.shared.broadcast.clone(), EventFilter::all(), Priority::Low);

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(listener, self.shared.clone(), rx.clone())),
            tokio::spawn(backpressure_loop(
                self.shared.broadcast.clone(),
                self.shared.config.saturation_interval,
                rx,
            )),
        ];

        *self.running.lock() = Some(Running {
            shutdown,
            tasks,
            bus: ctx.bus.clone(),
            subscription,
        });

        log::info!("📡 Streaming server listening on ws://{}", addr);
        log::info!("   ├─ Max connections: {}", self.shared.config.max_connections);
        log::info!(
            "   └─ Rate limit: {}/s (burst {}), queue depth {}",
            self.shared.config.rate_per_sec,
            self.shared.config.burst,
            self.shared.config.max_queue_depth
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.bus.unsubscribe(&running.subscription);
        let _ = running.shutdown.send(true);
        self.shared.broadcast.close_all();
        for task in running.tasks {
            let _ = task.await;
        }
        log::info!("📡 Streaming server stopped");
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        let stats = self.shared.broadcast.stats();
        let detail = format!(
            "{} clients, {} sent, {} dropped, {} disconnected",
            stats.clients, stats.sent, stats.dropped, stats.disconnected
        );
        if self.running.lock().is_none() {
            return HealthReport::with_status(HealthStatus::Stopped, detail);
        }
        HealthReport::with_status(HealthStatus::Healthy, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, StandardEvent};
    use crate::orchestration::lifecycle::tests::test_context;
    use serde_json::json;

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            saturation_interval: Duration::from_millis(50),
            ..StreamingConfig::default()
        }
    }

    async fn next_server_message<S>(read: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), read.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_receive_and_ping() {
        let ctx = test_context();
        let server = StreamingServer::new(test_config());
        server.start(&ctx).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut write, mut read) = ws.split();

        let subscribe = json!({"type": "subscribe", "symbols": ["BTC"], "event_types": ["ticker"]});
        write.send(Message::Text(subscribe.to_string().into())).await.unwrap();
        match next_server_message(&mut read).await {
            ServerMessage::Subscribed { filters, compression, .. } => {
                assert!(filters.symbols.contains("BTC"));
                assert!(!compression);
            }
            other => panic!("expected subscribed, got {other:?}"),
        }

        ctx.bus
            .publish(StandardEvent::new(EventType::Ticker, "okx", "ETH", json!({"last": 1.0})))
            .await
            .unwrap();
        let wanted = StandardEvent::new(EventType::Ticker, "okx", "BTC", json!({"last": 2.0}));
        ctx.bus.publish(wanted.clone()).await.unwrap();
        match next_server_message(&mut read).await {
            ServerMessage::Event { event } => assert_eq!(event.event_id, wanted.event_id),
            other => panic!("expected event, got {other:?}"),
        }

        write.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert!(matches!(next_server_message(&mut read).await, ServerMessage::Pong { .. }));

        write.send(Message::Text("garbage".into())).await.unwrap();
        assert!(matches!(next_server_message(&mut read).await, ServerMessage::Error { .. }));

        assert_eq!(server.connections(), 1);
        server.stop().await.unwrap();
        assert!(matches!(server.health().await.status, HealthStatus::Stopped));
    }

    #[tokio::test]
    async fn test_max_connections_rejects_extra_clients() {
        let ctx = test_context();
        let server = StreamingServer::new(StreamingConfig {
            max_connections: 1,
            ..test_config()
        });
        server.start(&ctx).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());

        let (_first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        // wait until the first connection is counted
        for _ in 0..100 {
            if server.connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());

        server.stop().await.unwrap();
    }
}
