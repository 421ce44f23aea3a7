//! chainmux-core — foundation types for ChainMux.
//!
//! # Overview
//!
//! ChainMux shares a small number of long-lived WebSocket connections (one
//! per chain) between any number of short-lived consumers that each want
//! live marketplace updates. The core crate is free of I/O and defines:
//!
//! - [`ChainId`] / [`ChainConfig`] — the static chain registry
//! - [`SubscriptionSpec`] / [`SubscriptionKey`] — what a consumer wants, and its canonical key
//! - [`OutboundMessage`] / [`InboundFrame`] — wire types and frame validation
//! - [`Registry`] — per-chain reference counting of subscriptions
//! - [`SendQueue`] — ordered outbound buffer with net-zero elision
//! - [`ReconnectBackoff`] — capped exponential reconnect schedule
//! - [`MuxConfig`] — configuration
//! - [`MuxError`] — structured error type

pub mod backoff;
pub mod chain;
pub mod config;
pub mod error;
pub mod key;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod registry;

pub use backoff::{Backoff, ReconnectBackoff, ReconnectConfig};
pub use chain::{chains, ChainConfig, ChainId};
pub use config::MuxConfig;
pub use error::MuxError;
pub use key::{SubscriptionKey, SubscriptionSpec};
pub use message::{Inbound, InboundFrame, MessageKind, OutboundMessage};
pub use metrics::ConnectionMetrics;
pub use queue::{Enqueued, FrameTag, QueuedFrame, SendQueue};
pub use registry::{Acquired, Registry, Released};
