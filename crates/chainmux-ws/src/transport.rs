//! The `Connector` trait — how a [`Connection`](crate::Connection) obtains a socket.
//!
//! A connector turns a chain's configuration into one live session: a sink
//! for outbound text frames and a stream of inbound text frames. The stream
//! ending (or yielding an error) means the session is gone; the connection
//! then reconnects by calling [`Connector::connect`] again.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use chainmux_core::{ChainConfig, MuxError};

/// Outbound half of a session.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = MuxError> + Send>>;

/// Inbound half of a session.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, MuxError>> + Send>>;

/// Opens WebSocket sessions.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; one connector is shared by every
/// chain's connection task.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, chain: &ChainConfig) -> Result<(FrameSink, FrameStream), MuxError>;
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    api_key: Option<String>,
}

impl TungsteniteConnector {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, chain: &ChainConfig) -> Result<(FrameSink, FrameStream), MuxError> {
        let chain_id = chain.id;
        let url = chain.endpoint(self.api_key.as_deref())?;

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| MuxError::Connection {
                chain: chain_id,
                reason: e.to_string(),
            })?;
        let (sink, stream) = ws.split();

        let sink = sink
            .with(|text: String| {
                future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(
                    text.into(),
                )))
            })
            .sink_map_err(move |e| MuxError::Connection {
                chain: chain_id,
                reason: e.to_string(),
            });

        // Pings are answered by tungstenite itself; only text frames and the
        // end of the session are interesting here.
        let stream = stream.filter_map(move |msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => Some(Err(MuxError::Connection {
                    chain: chain_id,
                    reason: match frame {
                        Some(f) => format!("closed by server: {} {}", u16::from(f.code), f.reason),
                        None => "closed by server".into(),
                    },
                })),
                Ok(_) => None,
                Err(e) => Some(Err(MuxError::Connection {
                    chain: chain_id,
                    reason: e.to_string(),
                })),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
