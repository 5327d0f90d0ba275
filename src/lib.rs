//! # marketflow
//!
//! Event-driven market-data core: connectors normalize exchange feeds into
//! standard events, a publish/subscribe bus routes them through the analytics
//! processors, the storage sink persists them, and the streaming server fans
//! them out to WebSocket clients.
//!
//! ## Flow
//!
//! ```text
//! connectors ──► event bus ──► processors ──► event bus
//!                    │
//!                    ├──► storage sink
//!                    └──► streaming server ──► clients
//! ```
//!
//! The [`runtime::Runtime`] wires everything into one lifecycle, driven by
//! [`config::CoreConfig`].

pub mod backoff;
pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod orchestration;
pub mod processor;
pub mod runtime;
pub mod storage;
pub mod streaming;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use event::{EventType, StandardEvent, Timeframe};
pub use runtime::Runtime;
