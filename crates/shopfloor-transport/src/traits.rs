//! Transport abstraction traits.
//!
//! The connection manager only ever sees these traits, so the same lifecycle
//! code runs over a real WebSocket or an in-memory pair.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a connection ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    /// Whether the peer closed the connection deliberately.
    pub clean: bool,
    /// Close code, if the peer sent one.
    pub code: Option<u16>,
    /// Close reason text, if the peer sent one.
    pub reason: Option<String>,
}

impl CloseReason {
    /// A deliberate close with no details.
    #[must_use]
    pub fn clean() -> Self {
        Self {
            clean: true,
            ..Self::default()
        }
    }

    /// An abnormal close (dropped link, protocol error).
    #[must_use]
    pub fn unclean(reason: impl Into<String>) -> Self {
        Self {
            clean: false,
            code: None,
            reason: Some(reason.into()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.clean { "clean" } else { "unclean" })?;
        if let Some(code) = self.code {
            write!(f, " ({code})")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

/// Something received from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A data message. Text and binary messages are treated alike.
    Message(Bytes),
    /// A message the transport dropped; the connection stays open.
    Rejected(String),
    /// The connection ended.
    Closed(CloseReason),
}

/// Pass `data` on as a message, or reject it when it exceeds `max` bytes.
#[must_use]
pub fn checked_message(data: Bytes, max: usize) -> Inbound {
    if data.len() > max {
        let error = TransportError::MessageTooLarge {
            size: data.len(),
            max,
        };
        warn!(size = data.len(), max, "Dropping oversized message");
        return Inbound::Rejected(error.to_string());
    }
    Inbound::Message(data)
}

/// Opens client connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// Resolves once the handshake completed.
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open client connection.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next message.
    ///
    /// Returns [`Inbound::Closed`] once the connection ended; an `Err` is a
    /// failure that also ends the connection.
    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    /// Send a text message.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully, telling the peer why.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
