//! Real-time fan-out of bus events to WebSocket clients

pub mod broadcast;
pub mod compression;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod subscription;

pub use broadcast::{BroadcastConfig, BroadcastManager, BroadcastStats};
pub use compression::{decompress, Frame, MessageCompressor};
pub use protocol::{ClientMessage, ServerMessage};
pub use rate_limit::{ClientOutbox, TokenBucket};
pub use server::{StreamingConfig, StreamingServer};
pub use subscription::{matches, ClientId, Subscription, SubscriptionFilters, SubscriptionManager};
