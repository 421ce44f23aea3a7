//! The subscription multiplexer.
//!
//! One instance per application. It owns a [`Registry`] and a [`Connection`]
//! per configured chain and is the only thing that writes subscription
//! frames: a subscribe goes out on a key's 0→1 transition, an unsubscribe on
//! its 1→0 transition, and every live subscribe is replayed whenever a
//! chain's connection (re)opens.
//!
//! `acquire` and `release` never suspend. Each chain's registry sits behind
//! its own mutex, held while the resulting frame is queued, so concurrent
//! calls for the same key are linearizable and queue order matches registry
//! order. Handlers are always invoked with no lock held, so a message
//! handler may itself acquire or release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use chainmux_core::{
    Acquired, ChainConfig, ChainId, ConnectionMetrics, FrameTag, InboundFrame, MuxConfig,
    MuxError, OutboundMessage, Registry, Released, SubscriptionKey, SubscriptionSpec,
};

use crate::connection::{Connection, ConnectionState, HandlerId};
use crate::transport::{Connector, TungsteniteConnector};

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain; nothing was sent.
    Retained { ref_count: u32 },
    /// Last holder gone; an unsubscribe was queued (or cancelled a pending
    /// subscribe).
    Unsubscribed,
    /// No live entry for the key. Logged and counted, never fatal.
    UnknownKey,
}

/// Per-chain registry + connection pair.
struct ChainSlot {
    registry: Mutex<Registry>,
    connection: Connection,
}

impl ChainSlot {
    fn id(&self) -> ChainId {
        self.connection.chain().id
    }

    /// Queue the subscribe of every live entry after the socket (re)opened.
    fn replay(&self) {
        let registry = self.registry.lock().unwrap();
        let mut replayed = 0usize;
        for (key, subscribe) in registry.active_entries() {
            match subscribe.to_json() {
                Ok(payload) => {
                    if self.connection.replay(key, payload) {
                        replayed += 1;
                    }
                }
                Err(e) => error!(chain = %self.id(), key = %key, error = %e, "cannot serialize replay"),
            }
        }
        if replayed > 0 {
            info!(chain = %self.id(), replayed, active = registry.len(), "resubscribed active subscriptions");
        }
    }
}

struct MuxInner {
    chains: HashMap<ChainId, Arc<ChainSlot>>,
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        for slot in self.chains.values() {
            slot.connection.close();
        }
    }
}

/// Process-wide subscription multiplexer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Build a multiplexer over `connector`. Connections stay idle until a
    /// chain is first used (or [`open_all`](Self::open_all) is called).
    ///
    /// When built inside a Tokio runtime, connection tasks are spawned on
    /// that runtime, so `acquire` and `release` may then be called from any
    /// thread.
    pub fn new(config: MuxConfig, connector: Arc<dyn Connector>) -> Result<Self, MuxError> {
        config.validate()?;
        let mut chains = HashMap::with_capacity(config.chains.len());
        for chain in &config.chains {
            let slot = Arc::new(ChainSlot {
                registry: Mutex::new(Registry::new(chain.id)),
                connection: Connection::new(
                    chain.clone(),
                    Arc::clone(&connector),
                    config.reconnect.clone(),
                ),
            });
            let weak: Weak<ChainSlot> = Arc::downgrade(&slot);
            slot.connection.on_status_change(move |state| {
                if state == ConnectionState::Open {
                    if let Some(slot) = weak.upgrade() {
                        slot.replay();
                    }
                }
            });
            chains.insert(chain.id, slot);
        }
        Ok(Self {
            inner: Arc::new(MuxInner { chains }),
        })
    }

    /// Build a multiplexer that talks to the real endpoints.
    pub fn connect(config: MuxConfig) -> Result<Self, MuxError> {
        let connector = Arc::new(TungsteniteConnector::new(config.api_key.clone()));
        Self::new(config, connector)
    }

    fn slot(&self, chain: ChainId) -> Result<&Arc<ChainSlot>, MuxError> {
        self.inner
            .chains
            .get(&chain)
            .ok_or(MuxError::UnknownChain { chain })
    }

    /// Configured chains, ordered by id.
    pub fn chains(&self) -> Vec<ChainConfig> {
        let mut chains: Vec<_> = self
            .inner
            .chains
            .values()
            .map(|s| s.connection.chain().clone())
            .collect();
        chains.sort_by_key(|c| c.id);
        chains
    }

    /// Start `chain`'s connection. Idempotent.
    pub fn open(&self, chain: ChainId) -> Result<(), MuxError> {
        self.slot(chain)?.connection.open()
    }

    /// Start every chain's connection eagerly.
    pub fn open_all(&self) -> Result<(), MuxError> {
        for slot in self.inner.chains.values() {
            slot.connection.open()?;
        }
        Ok(())
    }

    /// Register interest in `spec` on `chain`. The returned handle releases
    /// on drop.
    pub fn acquire(&self, chain: ChainId, spec: &SubscriptionSpec) -> Result<SubscriptionHandle, MuxError> {
        let key = spec.key();
        self.acquire_raw(
            chain,
            key.clone(),
            spec.subscribe_message(),
            spec.unsubscribe_message(),
        )?;
        Ok(SubscriptionHandle {
            mux: self.clone(),
            chain,
            key,
            live: true,
        })
    }

    /// Key-level acquire. Sends `subscribe` only on the key's 0→1 transition.
    ///
    /// Every successful call must be balanced by exactly one
    /// [`release_key`](Self::release_key). If no runtime can drive the
    /// connection yet, the bookkeeping still happens and the subscribe waits
    /// in the queue until [`open`](Self::open) succeeds.
    pub fn acquire_raw(
        &self,
        chain: ChainId,
        key: SubscriptionKey,
        subscribe: OutboundMessage,
        unsubscribe: OutboundMessage,
    ) -> Result<Acquired, MuxError> {
        let slot = self.slot(chain)?;
        if slot.connection.state() == ConnectionState::Closed {
            return Err(MuxError::Closed { chain });
        }
        let payload = subscribe.to_json()?;
        if let Err(e) = slot.connection.open() {
            warn!(chain = %chain, key = %key, error = %e, "connection not started; subscribe stays queued");
        }

        let mut registry = slot.registry.lock().unwrap();
        let acquired = registry.acquire(key.clone(), subscribe, unsubscribe);
        if acquired.is_new_subscription {
            if let Err(e) = slot.connection.send(FrameTag::Subscribe(key.clone()), payload) {
                error!(chain = %chain, key = %key, error = %e, "failed to queue subscribe");
            }
        }
        debug!(chain = %chain, key = %key, ref_count = acquired.ref_count, "acquired");
        Ok(acquired)
    }

    /// Release a handle. Equivalent to dropping it, but reports the outcome.
    pub fn release(&self, handle: SubscriptionHandle) -> ReleaseOutcome {
        handle.release()
    }

    /// Key-level release. Sends the unsubscribe only on the 1→0 transition.
    ///
    /// Releasing a key that has no live entry is a caller bug; it is logged
    /// and reported as [`ReleaseOutcome::UnknownKey`] rather than failing.
    pub fn release_key(&self, chain: ChainId, key: &SubscriptionKey) -> ReleaseOutcome {
        let slot = match self.slot(chain) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(chain = %chain, key = %key, error = %e, "release on unconfigured chain");
                return ReleaseOutcome::UnknownKey;
            }
        };

        let mut registry = slot.registry.lock().unwrap();
        match registry.release(key) {
            Ok(Released::Retained { ref_count }) => {
                debug!(chain = %chain, key = %key, ref_count, "released");
                ReleaseOutcome::Retained { ref_count }
            }
            Ok(Released::Last { unsubscribe }) => {
                debug!(chain = %chain, key = %key, "last release");
                match unsubscribe.to_json() {
                    Ok(payload) => {
                        if let Err(e) = slot.connection.send(FrameTag::Unsubscribe(key.clone()), payload) {
                            debug!(chain = %chain, key = %key, error = %e, "unsubscribe not queued");
                        }
                    }
                    Err(e) => error!(chain = %chain, key = %key, error = %e, "cannot serialize unsubscribe"),
                }
                ReleaseOutcome::Unsubscribed
            }
            Err(e) => {
                warn!(error = %e, "release without matching acquire");
                slot.connection.record(|m| m.unknown_releases += 1);
                ReleaseOutcome::UnknownKey
            }
        }
    }

    /// Register an inbound-frame handler for `chain`.
    ///
    /// A handler that captures a clone of this multiplexer keeps it alive;
    /// such owners must call [`shutdown`](Self::shutdown) explicitly.
    pub fn on_message(
        &self,
        chain: ChainId,
        handler: impl Fn(&InboundFrame) + Send + Sync + 'static,
    ) -> Result<HandlerId, MuxError> {
        Ok(self.slot(chain)?.connection.on_message(handler))
    }

    pub fn remove_handler(&self, chain: ChainId, id: HandlerId) -> bool {
        self.slot(chain)
            .map(|s| s.connection.remove_handler(id))
            .unwrap_or(false)
    }

    /// Observe `chain`'s connection state, e.g. to show connectivity in a UI.
    pub fn on_status_change(
        &self,
        chain: ChainId,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Result<(), MuxError> {
        self.slot(chain)?.connection.on_status_change(handler);
        Ok(())
    }

    /// Current reference count of `key` on `chain` (0 if absent).
    pub fn ref_count(&self, chain: ChainId, key: &SubscriptionKey) -> u32 {
        self.slot(chain)
            .map(|s| s.registry.lock().unwrap().ref_count(key))
            .unwrap_or(0)
    }

    /// Keys with at least one holder on `chain`, ordered.
    pub fn active_keys(&self, chain: ChainId) -> Vec<SubscriptionKey> {
        self.slot(chain)
            .map(|s| s.registry.lock().unwrap().keys())
            .unwrap_or_default()
    }

    pub fn state(&self, chain: ChainId) -> Option<ConnectionState> {
        self.slot(chain).ok().map(|s| s.connection.state())
    }

    pub fn metrics(&self, chain: ChainId) -> Option<ConnectionMetrics> {
        self.slot(chain).ok().map(|s| s.connection.metrics())
    }

    /// Frames queued on `chain` but not yet written to the socket.
    pub fn pending_frames(&self, chain: ChainId) -> usize {
        self.slot(chain)
            .map(|s| s.connection.pending_frames())
            .unwrap_or(0)
    }

    /// Close every connection. Terminal; later acquires fail with
    /// [`MuxError::Closed`].
    pub fn shutdown(&self) {
        for slot in self.inner.chains.values() {
            slot.connection.close();
        }
    }
}

/// Scoped interest in one subscription. Dropping the handle releases it,
/// so every exit path of the owning scope gives the reference back.
#[must_use = "dropping the handle releases the subscription immediately"]
pub struct SubscriptionHandle {
    mux: Multiplexer,
    chain: ChainId,
    key: SubscriptionKey,
    live: bool,
}

impl SubscriptionHandle {
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Release now and report what happened.
    pub fn release(mut self) -> ReleaseOutcome {
        self.live = false;
        self.mux.release_key(self.chain, &self.key)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("chain", &self.chain)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.live {
            self.live = false;
            self.mux.release_key(self.chain, &self.key);
        }
    }
}
