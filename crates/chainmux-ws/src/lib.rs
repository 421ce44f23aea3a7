//! chainmux-ws — reference-counted WebSocket subscription multiplexer.
//!
//! # Features
//! - One shared connection per chain, opened lazily
//! - Reference-counted subscribe / unsubscribe: one frame per 0→1 / 1→0 transition
//! - Ordered send queue that buffers while disconnected
//! - Auto-reconnect with capped exponential backoff
//! - Auto-resubscribe of every live subscription after reconnect
//! - Validated fan-out of inbound frames to any number of handlers
//! - RAII [`SubscriptionHandle`] and [`EventStream`] consumer hooks

pub mod connection;
pub mod hook;
pub mod multiplexer;
pub mod transport;

pub use connection::{Connection, ConnectionState, HandlerId};
pub use hook::{token_updates, EventStream};
pub use multiplexer::{Multiplexer, ReleaseOutcome, SubscriptionHandle};
pub use transport::{Connector, FrameSink, FrameStream, TungsteniteConnector};
