//! One WebSocket per chain, with auto-reconnect and an ordered send queue.
//!
//! State machine:
//! - `Connecting`   → `Open`:          first session established
//! - `Connecting`   → `Reconnecting`:  first connect failed
//! - `Open`         → `Reconnecting`:  session lost (close, error, stream end)
//! - `Reconnecting` → `Open`:          session re-established
//! - any            → `Closed`:        [`Connection::close`]; terminal
//!
//! Reconnect attempts never stop, but their rate is bounded by
//! [`ReconnectBackoff`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info, warn};

use chainmux_core::{
    ChainConfig, ChainId, ConnectionMetrics, Enqueued, FrameTag, Inbound, InboundFrame, MuxError,
    QueuedFrame, ReconnectBackoff, ReconnectConfig, SendQueue, SubscriptionKey,
};

use crate::transport::{Connector, FrameSink, FrameStream};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connect attempt in progress (or not started yet).
    Connecting,
    /// Socket is up; the send queue is flushing.
    Open,
    /// Session lost or connect failed; waiting out backoff.
    Reconnecting,
    /// Torn down for good.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Callback for validated inbound frames.
pub type MessageHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Callback for state transitions.
pub type StatusHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Token returned by [`Connection::on_message`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Inner {
    state: ConnectionState,
    queue: SendQueue,
    message_handlers: Vec<(HandlerId, MessageHandler)>,
    status_handlers: Vec<StatusHandler>,
    metrics: ConnectionMetrics,
}

/// State shared between the handle and the background task.
struct Shared {
    chain: ChainConfig,
    inner: Mutex<Inner>,
    /// Wakes the task: new frames queued, or closed.
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ConnectionState::Closed
    }

    fn id(&self) -> ChainId {
        self.chain.id
    }

    /// Move to `next` and notify status handlers outside the lock, so a
    /// handler may call back into the connection. `Closed` is sticky.
    fn transition(&self, next: ConnectionState) {
        let handlers = {
            let mut inner = self.lock();
            if inner.state == next || inner.state == ConnectionState::Closed {
                return;
            }
            debug!(chain = %self.id(), from = %inner.state, to = %next, "connection state change");
            inner.state = next;
            inner.status_handlers.clone()
        };
        for handler in handlers {
            handler(next);
        }
    }
}

/// A chain's shared WebSocket connection.
///
/// Created idle; [`open`](Self::open) spawns the background task that owns
/// the socket. Frames passed to [`send`](Self::send) are buffered while the
/// socket is down and transmitted in enqueue order once it is open.
pub struct Connection {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    /// Runtime the connection task is spawned on; captured at construction
    /// when available so `open` works from threads outside the runtime.
    runtime: Option<Handle>,
    started: AtomicBool,
    next_handler: AtomicU64,
}

impl Connection {
    pub fn new(chain: ChainConfig, connector: Arc<dyn Connector>, reconnect: ReconnectConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Connecting,
                    queue: SendQueue::new(),
                    message_handlers: Vec::new(),
                    status_handlers: Vec::new(),
                    metrics: ConnectionMetrics::default(),
                }),
                wake: Notify::new(),
            }),
            connector,
            reconnect,
            runtime: Handle::try_current().ok(),
            started: AtomicBool::new(false),
            next_handler: AtomicU64::new(1),
        }
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.shared.chain
    }

    /// Start the background task. Idempotent, and a no-op once closed.
    ///
    /// The task runs on the runtime captured by [`new`](Self::new), or else
    /// on the caller's. With neither available this fails with
    /// [`MuxError::NoRuntime`] and a later call may retry. Connect failures
    /// never surface here: the connection moves to `Reconnecting` and keeps
    /// trying.
    pub fn open(&self) -> Result<(), MuxError> {
        if self.shared.is_closed() || self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            self.started.store(false, Ordering::Release);
            return Err(MuxError::NoRuntime { chain: self.shared.id() });
        };
        let shared = Arc::clone(&self.shared);
        let connector = Arc::clone(&self.connector);
        let reconnect = self.reconnect.clone();
        runtime.spawn(async move {
            run(shared, connector, reconnect).await;
        });
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Queue a frame for transmission.
    ///
    /// Fails only if the connection is closed or the queue rejects a
    /// duplicate subscribe; transient disconnection never drops a frame.
    pub fn send(&self, tag: FrameTag, payload: String) -> Result<Enqueued, MuxError> {
        let outcome = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed {
                return Err(MuxError::Closed { chain: self.shared.id() });
            }
            let outcome = inner.queue.push(QueuedFrame::new(tag, payload))?;
            if outcome == Enqueued::Elided {
                inner.metrics.frames_elided += 1;
            }
            outcome
        };
        self.shared.wake.notify_one();
        Ok(outcome)
    }

    /// Queue a replayed subscribe, skipping keys with a frame still pending.
    /// Returns whether anything was queued.
    pub fn replay(&self, key: SubscriptionKey, payload: String) -> bool {
        let queued = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            let queued = inner
                .queue
                .push_replay(QueuedFrame::new(FrameTag::Subscribe(key), payload));
            if queued {
                inner.metrics.resubscriptions += 1;
            }
            queued
        };
        if queued {
            self.shared.wake.notify_one();
        }
        queued
    }

    /// Register a handler invoked for every validated inbound event frame.
    /// All handlers see every frame, in registration order.
    pub fn on_message(&self, handler: impl Fn(&InboundFrame) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.shared.lock();
        // A closed connection never dispatches again; dropping the handler
        // now lets its owner see the end of input.
        if inner.state != ConnectionState::Closed {
            inner.message_handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Deregister a message handler. Returns `false` if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.shared.lock();
        let before = inner.message_handlers.len();
        inner.message_handlers.retain(|(h, _)| *h != id);
        inner.message_handlers.len() != before
    }

    /// Register a handler invoked on every state transition.
    pub fn on_status_change(&self, handler: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.shared.lock().status_handlers.push(Arc::new(handler));
    }

    /// Number of frames waiting for the socket.
    pub fn pending_frames(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.lock().metrics.clone()
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut ConnectionMetrics)) {
        f(&mut self.shared.lock().metrics);
    }

    /// Tear the connection down. Terminal: pending frames are discarded and
    /// later sends fail with [`MuxError::Closed`].
    ///
    /// Every handler is dropped after status handlers see `Closed`, so
    /// anything a handler owns (such as an [`EventStream`](crate::EventStream)
    /// sender) is released and its consumer observes the end of the stream.
    pub fn close(&self) {
        let (status_handlers, message_handlers) = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            info!(chain = %self.shared.id(), pending = inner.queue.len(), "closing connection");
            inner.state = ConnectionState::Closed;
            (
                std::mem::take(&mut inner.status_handlers),
                std::mem::take(&mut inner.message_handlers),
            )
        };
        self.shared.wake.notify_one();
        drop(message_handlers);
        for handler in status_handlers {
            handler(ConnectionState::Closed);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why a session ended.
enum SessionEnd {
    Closed,
    Lost(MuxError),
}

/// Background task that owns the socket.
async fn run(shared: Arc<Shared>, connector: Arc<dyn Connector>, reconnect: ReconnectConfig) {
    let mut backoff = ReconnectBackoff::new(reconnect);

    loop {
        info!(chain = %shared.id(), url = %shared.chain.ws_url, "connecting via WebSocket");

        let Some(connected) = until_closed(&shared, connector.connect(&shared.chain)).await else {
            break;
        };

        match connected {
            Err(e) => {
                warn!(chain = %shared.id(), error = %e, "WS connect failed");
                shared.lock().metrics.reconnections += 1;
                shared.transition(ConnectionState::Reconnecting);
            }
            Ok((mut sink, mut stream)) => {
                backoff.reset();
                info!(chain = %shared.id(), "WS connected");
                // Status handlers run here; the multiplexer queues its replay.
                shared.transition(ConnectionState::Open);

                match session(&shared, &mut sink, &mut stream).await {
                    SessionEnd::Closed => {
                        let _ = sink.close().await;
                        break;
                    }
                    SessionEnd::Lost(e) => {
                        warn!(chain = %shared.id(), error = %e, "WS disconnected");
                        shared.lock().metrics.reconnections += 1;
                        shared.transition(ConnectionState::Reconnecting);
                    }
                }
            }
        }

        let delay = backoff.next_delay();
        debug!(chain = %shared.id(), attempt = backoff.attempt(), "reconnecting in {delay:?}");
        if until_closed(&shared, time::sleep(delay)).await.is_none() {
            break;
        }
    }

    debug!(chain = %shared.id(), "connection task finished");
}

/// Drive one live session until it is lost or the connection is closed.
async fn session(shared: &Shared, sink: &mut FrameSink, stream: &mut FrameStream) -> SessionEnd {
    loop {
        if let Err(e) = flush(shared, sink).await {
            return SessionEnd::Lost(e);
        }
        if shared.is_closed() {
            return SessionEnd::Closed;
        }
        tokio::select! {
            _ = shared.wake.notified() => {}
            msg = stream.next() => match msg {
                Some(Ok(text)) => dispatch(shared, &text),
                Some(Err(e)) => return SessionEnd::Lost(e),
                None => {
                    return SessionEnd::Lost(MuxError::Connection {
                        chain: shared.id(),
                        reason: "stream ended".into(),
                    })
                }
            },
        }
    }
}

/// Transmit queued frames in order while the connection is open. A frame
/// whose write fails goes back to the head of the queue.
async fn flush(shared: &Shared, sink: &mut FrameSink) -> Result<(), MuxError> {
    loop {
        let frame = {
            let mut inner = shared.lock();
            if inner.state != ConnectionState::Open {
                return Ok(());
            }
            match inner.queue.pop_front() {
                Some(frame) => frame,
                None => return Ok(()),
            }
        };

        match sink.send(frame.payload.clone()).await {
            Ok(()) => {
                debug!(chain = %shared.id(), payload = %frame.payload, "sent frame");
                shared.lock().metrics.record_sent(&frame.tag);
            }
            Err(e) => {
                shared.lock().queue.push_front(frame);
                return Err(e);
            }
        }
    }
}

/// Validate one inbound text frame and fan it out to every handler.
fn dispatch(shared: &Shared, text: &str) {
    match Inbound::parse(text) {
        Ok(Inbound::Event(frame)) => {
            let handlers: Vec<MessageHandler> = {
                let mut inner = shared.lock();
                inner.metrics.frames_received += 1;
                inner.message_handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
            };
            debug!(chain = %shared.id(), event = %frame.event, handlers = handlers.len(), "dispatching frame");
            for handler in handlers {
                handler(&frame);
            }
        }
        Ok(Inbound::Control { kind, status }) => {
            debug!(chain = %shared.id(), kind = %kind, status = ?status, "control frame");
            shared.lock().metrics.control_frames += 1;
        }
        Err(e) => {
            warn!(chain = %shared.id(), error = %e, "dropping malformed frame");
            shared.lock().metrics.frames_malformed += 1;
        }
    }
}

/// Run `fut` unless the connection is closed first.
async fn until_closed<F: Future>(shared: &Shared, fut: F) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        if shared.is_closed() {
            return None;
        }
        tokio::select! {
            out = &mut fut => return Some(out),
            _ = shared.wake.notified() => {}
        }
    }
}
