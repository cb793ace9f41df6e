//! WebSocket transport implementation.
//!
//! Client side of the order feed, using tokio-tungstenite. `ws://` and
//! `wss://` (rustls with webpki roots) are both supported.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

use crate::traits::{checked_message, CloseReason, Connection, Connector, Inbound, TransportError};

/// Default maximum inbound message size (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Opens WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(status = %response.status(), "WebSocket handshake completed");

        Ok(Box::new(WebSocketConnection::new(
            stream,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, max_message_size: usize) -> Self {
        Self {
            stream,
            is_open: true,
            max_message_size,
        }
    }

}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(checked_message(Bytes::from(text), self.max_message_size));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(checked_message(Bytes::from(data), self.max_message_size));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                    return Ok(Inbound::Closed(close_reason(frame)));
                }
                Some(Err(WsError::ConnectionClosed)) => {
                    self.is_open = false;
                    return Ok(Inbound::Closed(CloseReason::clean()));
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended without close frame");
                    self.is_open = false;
                    return Ok(Inbound::Closed(CloseReason::unclean(
                        "connection ended unexpectedly",
                    )));
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        trace!(len = text.len(), "Sending text message");
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {e}"))),
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// A close frame means the peer ended the connection deliberately, whatever
/// its code.
fn close_reason(frame: Option<CloseFrame<'static>>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason {
            clean: true,
            code: Some(u16::from(frame.code)),
            reason: Some(frame.reason.to_string()).filter(|r| !r.is_empty()),
        },
        None => CloseReason::clean(),
    }
}
