//! Multiplexer error types.

use thiserror::Error;

use crate::chain::ChainId;
use crate::key::SubscriptionKey;

/// Errors that can occur anywhere in the subscription pipeline.
#[derive(Debug, Error)]
pub enum MuxError {
    /// WebSocket connect/send/receive failure. Absorbed by the connection,
    /// which moves to `Reconnecting`.
    #[error("connection error on chain {chain}: {reason}")]
    Connection { chain: ChainId, reason: String },

    /// Inbound frame failed validation and was discarded.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// `release` was called for a key with no live entry (double release).
    #[error("unknown subscription key {key} on chain {chain}")]
    UnknownKey { chain: ChainId, key: SubscriptionKey },

    /// A second subscribe frame was enqueued while one is still pending.
    #[error("duplicate subscribe for key {key}")]
    DuplicateSubscribe { key: SubscriptionKey },

    /// The chain is not part of the configured chain registry.
    #[error("chain {chain} is not configured")]
    UnknownChain { chain: ChainId },

    /// The connection for this chain has been torn down.
    #[error("connection for chain {chain} is closed")]
    Closed { chain: ChainId },

    /// No Tokio runtime was reachable to drive the chain's connection task.
    /// Frames stay queued until the connection is opened from a runtime.
    #[error("no Tokio runtime available to drive chain {chain}")]
    NoRuntime { chain: ChainId },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MuxError {
    /// Returns `true` if this error is transient and the operation will be
    /// retried by the reconnect loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if this error indicates caller misuse rather than a
    /// network or protocol condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownKey { .. }
                | Self::DuplicateSubscribe { .. }
                | Self::UnknownChain { .. }
                | Self::Closed { .. }
                | Self::NoRuntime { .. }
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}
