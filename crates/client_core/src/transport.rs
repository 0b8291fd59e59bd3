//! Byte-level transport underneath a [`crate::Connection`].
//!
//! A transport hands back a [`TransportLink`]: an ordered outbound queue plus a
//! stream of inbound frames. The production implementation speaks WebSocket via
//! `tokio-tungstenite`; tests plug in an in-memory link.

use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

pub struct TransportLink {
    /// Frames written here reach the peer in the order they were queued.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Ends when the peer closes the link.
    pub inbound: FrameStream,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError>;
}

pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        let url = websocket_url(address)?;
        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    address: url.to_string(),
                    reason: err.to_string(),
                })?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(bytes) => Message::Binary(bytes),
                };
                if let Err(err) = ws_writer.send(message).await {
                    warn!(%err, "websocket send failed");
                    break;
                }
            }
            if let Err(err) = ws_writer.close().await {
                debug!(%err, "websocket close after writer shutdown failed");
            }
        });

        let inbound = ws_reader
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes))),
                    // Close, ping and pong are handled by tungstenite itself.
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
                }
            })
            .boxed();

        Ok(TransportLink { outbound, inbound })
    }
}

/// Normalizes a server address to a WebSocket URL.
///
/// `http://` and `https://` are rewritten to `ws://` and `wss://`.
pub fn websocket_url(address: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let mut url = Url::parse(address.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to `{scheme}`")))?;
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
