//! Consumer hooks: per-feature helpers that bind a set of subscriptions and
//! a filtered inbound stream to the lifetime of one owner.
//!
//! ```no_run
//! # async fn example(mux: chainmux_ws::Multiplexer) -> Result<(), chainmux_core::MuxError> {
//! use chainmux_core::ChainId;
//! use chainmux_ws::hook::token_updates;
//!
//! let mut updates = token_updates(&mux, ChainId(1), "0xabc")?;
//! while let Some(frame) = updates.next().await {
//!     println!("{}", frame.event);
//! }
//! // Dropping `updates` releases both subscriptions.
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use chainmux_core::{ChainId, InboundFrame, MuxError, SubscriptionKey, SubscriptionSpec};

use crate::connection::HandlerId;
use crate::multiplexer::{Multiplexer, SubscriptionHandle};

/// Event emitted when a token's market state changes.
pub const TOKEN_UPDATED: &str = "token.updated";

/// Watched field: the floor ask order id.
pub const FLOOR_ASK_ID: &str = "market.floorAskNormalized.id";

/// Watched field: the floor ask gross price.
pub const FLOOR_ASK_PRICE: &str = "market.floorAskNormalized.price.gross.amount";

/// A live, filtered stream of inbound frames for a set of subscriptions.
///
/// Attaching registers a handler and acquires every spec; dropping releases
/// every spec and removes the handler.
pub struct EventStream {
    mux: Multiplexer,
    chain: ChainId,
    specs: Arc<RwLock<Vec<SubscriptionSpec>>>,
    handles: Vec<SubscriptionHandle>,
    handler: HandlerId,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl EventStream {
    /// Register a filtering handler on `chain`, then acquire every spec.
    ///
    /// The handler goes in first so no frame answering the new subscribes
    /// is missed. If any acquire fails, everything acquired so far is
    /// released again.
    pub fn attach(
        mux: &Multiplexer,
        chain: ChainId,
        specs: Vec<SubscriptionSpec>,
    ) -> Result<Self, MuxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Arc::new(RwLock::new(specs.clone()));
        let handler_filter = Arc::clone(&filter);
        let handler = mux.on_message(chain, move |frame| {
            let wanted = handler_filter
                .read()
                .map(|specs| specs.iter().any(|s| s.matches(frame)))
                .unwrap_or(false);
            if wanted {
                // Receiver gone means the stream is being dropped.
                let _ = tx.send(frame.clone());
            }
        })?;

        let handles = match acquire_all(mux, chain, &specs) {
            Ok(handles) => handles,
            Err(e) => {
                mux.remove_handler(chain, handler);
                return Err(e);
            }
        };

        Ok(Self {
            mux: mux.clone(),
            chain,
            specs: filter,
            handles,
            handler,
            rx,
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.handles.iter().map(|h| h.key().clone()).collect()
    }

    /// Switch to a different set of specs.
    ///
    /// A no-op when the derived keys are unchanged. Otherwise the old
    /// subscriptions are released first and the new ones acquired after;
    /// existing entries are never mutated in place.
    pub fn retarget(&mut self, specs: Vec<SubscriptionSpec>) -> Result<(), MuxError> {
        let new_keys: Vec<_> = specs.iter().map(SubscriptionSpec::key).collect();
        if new_keys == self.keys() {
            return Ok(());
        }

        self.handles.clear();
        if let Ok(mut filter) = self.specs.write() {
            *filter = specs.clone();
        }
        self.handles = acquire_all(&self.mux, self.chain, &specs)?;
        Ok(())
    }

    /// Wait for the next matching frame. Returns `None` once the chain's
    /// connection is closed.
    pub async fn next(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }

    /// Take a matching frame if one is already buffered.
    pub fn try_next(&mut self) -> Option<InboundFrame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = InboundFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.mux.remove_handler(self.chain, self.handler);
        self.handles.clear();
    }
}

fn acquire_all(
    mux: &Multiplexer,
    chain: ChainId,
    specs: &[SubscriptionSpec],
) -> Result<Vec<SubscriptionHandle>, MuxError> {
    specs.iter().map(|spec| mux.acquire(chain, spec)).collect()
}

/// Specs for floor-ask updates of every token in `contract`.
pub fn token_update_specs(contract: &str) -> Vec<SubscriptionSpec> {
    [FLOOR_ASK_ID, FLOOR_ASK_PRICE]
        .into_iter()
        .map(|changed| {
            SubscriptionSpec::new(TOKEN_UPDATED)
                .filter("contract", contract)
                .changed(changed)
        })
        .collect()
}

/// Live floor-ask updates for the tokens of `contract` on `chain`.
pub fn token_updates(mux: &Multiplexer, chain: ChainId, contract: &str) -> Result<EventStream, MuxError> {
    EventStream::attach(mux, chain, token_update_specs(contract))
}
