//! In-memory connector: each `connect` hands the test a `MockSession` whose
//! channels stand in for the two halves of a WebSocket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use chainmux_core::{ChainConfig, ChainId, MuxConfig, MuxError, ReconnectConfig};
use chainmux_ws::{Connector, FrameSink, FrameStream, Multiplexer};

pub const CHAIN: ChainId = ChainId(1);

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

pub struct MockConnector {
    sessions: mpsc::UnboundedSender<MockSession>,
    refuse: AtomicUsize,
    connects: AtomicUsize,
}

impl MockConnector {
    /// Fail the next `n` connect attempts.
    pub fn refuse(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, chain: &ChainConfig) -> Result<(FrameSink, FrameStream), MuxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MuxError::Connection {
                chain: chain.id,
                reason: "connection refused".into(),
            });
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<String, MuxError>>();
        let chain_id = chain.id;
        let sink = out_tx.sink_map_err(move |e| MuxError::Connection {
            chain: chain_id,
            reason: e.to_string(),
        });
        let _ = self.sessions.send(MockSession {
            outbound: out_rx,
            inbound: in_tx,
        });
        Ok((Box::pin(sink), Box::pin(in_rx)))
    }
}

/// Server side of one mock socket session.
pub struct MockSession {
    outbound: fmpsc::UnboundedReceiver<String>,
    inbound: fmpsc::UnboundedSender<Result<String, MuxError>>,
}

impl MockSession {
    /// Next frame the client wrote, parsed as JSON.
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.outbound.next())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("session closed while waiting for a frame");
        serde_json::from_str(&text).expect("outbound frame is not JSON")
    }

    /// Collect exactly `n` frames.
    pub async fn frames(&mut self, n: usize) -> Vec<Value> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_frame().await);
        }
        out
    }

    /// Assert nothing is written for a short while.
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(text)) = tokio::time::timeout(QUIET, self.outbound.next()).await {
            panic!("unexpected outbound frame: {text}");
        }
    }

    /// Deliver a text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        self.inbound
            .unbounded_send(Ok(text.into()))
            .expect("client side of the session is gone");
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(self) {}
}

pub struct Harness {
    pub mux: Multiplexer,
    pub connector: Arc<MockConnector>,
    sessions: mpsc::UnboundedReceiver<MockSession>,
}

impl Harness {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            sessions: tx,
            refuse: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        let config = MuxConfig {
            chains: vec![ChainConfig::new(CHAIN.0, "test", "ws://mock.invalid")],
            reconnect: ReconnectConfig {
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
                multiplier: 2.0,
            },
            api_key: None,
        };
        let mux = Multiplexer::new(config, connector.clone()).expect("valid config");
        Self {
            mux,
            connector,
            sessions: rx,
        }
    }

    /// Wait for the connection to open its next session.
    pub async fn next_session(&mut self) -> MockSession {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a connect")
            .expect("connector dropped")
    }
}

/// Poll `cond` until it holds or the wait budget runs out.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn event(contract: &str) -> String {
    serde_json::json!({
        "type": "event",
        "event": "token.updated",
        "tags": { "contract": contract },
        "changed": ["market.floorAskNormalized.price.gross.amount"],
        "data": { "token": { "contract": contract, "tokenId": "1" } }
    })
    .to_string()
}
