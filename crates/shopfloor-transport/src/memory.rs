//! In-memory transport.
//!
//! A connector and a scripted server joined by channels. The server side
//! decides per attempt whether to accept, reject or hold the handshake, which
//! makes every lifecycle path of a client reproducible without sockets.
//!
//! ```rust,ignore
//! let (connector, mut server) = memory::pair();
//! // hand `connector` to the client, then:
//! let pending = server.next().await.unwrap();
//! let mut peer = pending.accept();
//! peer.send_text(r#"{"type":"order_created","order_id":1}"#);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::traits::{checked_message, CloseReason, Connection, Connector, Inbound, TransportError};

/// Create a connected connector/server pair.
#[must_use]
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        refusing: AtomicBool::new(false),
        attempts: AtomicUsize::new(0),
    });

    (
        MemoryConnector {
            pending: pending_tx,
            shared: Arc::clone(&shared),
            max_message_size: None,
        },
        MemoryServer {
            incoming: pending_rx,
            shared,
        },
    )
}

struct Shared {
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

enum ClientFrame {
    Text(String),
    Close(String),
}

struct Link {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct MemoryConnector {
    pending: mpsc::UnboundedSender<PendingConnection>,
    shared: Arc<Shared>,
    max_message_size: Option<usize>,
}

impl MemoryConnector {
    /// Reject inbound messages larger than `max` bytes, as a socket would.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }

        let (responder, response) = oneshot::channel();
        self.pending
            .send(PendingConnection {
                endpoint: url.to_string(),
                responder,
            })
            .map_err(|_| TransportError::ConnectFailed("server shut down".to_string()))?;

        match response.await {
            Ok(Ok(link)) => Ok(Box::new(MemoryConnection {
                link,
                is_open: true,
                max_message_size: self.max_message_size,
            })),
            Ok(Err(reason)) => Err(TransportError::ConnectFailed(reason)),
            Err(_) => Err(TransportError::ConnectFailed(
                "handshake abandoned".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// An open in-memory client connection.
pub struct MemoryConnection {
    link: Link,
    is_open: bool,
    max_message_size: Option<usize>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        match self.link.inbound.recv().await {
            Some(Inbound::Closed(reason)) => {
                self.is_open = false;
                Ok(Inbound::Closed(reason))
            }
            Some(Inbound::Message(data)) => Ok(match self.max_message_size {
                Some(max) => checked_message(data, max),
                None => Inbound::Message(data),
            }),
            Some(message) => Ok(message),
            None => {
                self.is_open = false;
                Ok(Inbound::Closed(CloseReason::unclean("peer dropped")))
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.link
            .outbound
            .send(ClientFrame::Text(text))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.is_open, false) {
            let _ = self.link.outbound.send(ClientFrame::Close(reason.to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Server side of the in-memory transport.
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<PendingConnection>,
    shared: Arc<Shared>,
}

impl MemoryServer {
    /// Wait for the next connection attempt.
    ///
    /// Returns `None` once every connector was dropped.
    pub async fn next(&mut self) -> Option<PendingConnection> {
        self.incoming.recv().await
    }

    /// Take a connection attempt if one is waiting.
    pub fn try_next(&mut self) -> Option<PendingConnection> {
        self.incoming.try_recv().ok()
    }

    /// Refuse every attempt before it reaches the server.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Get the number of connect calls made so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// A connection attempt waiting for the server's decision.
///
/// Dropping it fails the attempt.
pub struct PendingConnection {
    endpoint: String,
    responder: oneshot::Sender<Result<Link, String>>,
}

impl PendingConnection {
    /// Get the URL the client connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Complete the handshake.
    #[must_use]
    pub fn accept(self) -> MemoryPeer {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        trace!(endpoint = %self.endpoint, "Memory connection accepted");

        let _ = self.responder.send(Ok(Link { inbound, outbound }));
        MemoryPeer {
            endpoint: self.endpoint,
            to_client,
            from_client,
            close_reason: None,
        }
    }

    /// Fail the handshake.
    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.responder.send(Err(reason.into()));
    }
}

/// Server end of an accepted connection.
///
/// Dropping the peer ends the connection uncleanly.
pub struct MemoryPeer {
    endpoint: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    close_reason: Option<String>,
}

impl MemoryPeer {
    /// Get the URL the client connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push a text message. Returns `false` if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_bytes(Bytes::from(text.into()))
    }

    /// Push a raw message. Returns `false` if the client is gone.
    pub fn send_bytes(&self, data: Bytes) -> bool {
        self.to_client.send(Inbound::Message(data)).is_ok()
    }

    /// Close the connection deliberately.
    pub fn close_clean(self) {
        self.close_with(CloseReason {
            clean: true,
            code: Some(1000),
            reason: None,
        });
    }

    /// Close the connection with the given reason.
    pub fn close_with(self, reason: CloseReason) {
        let _ = self.to_client.send(Inbound::Closed(reason));
    }

    /// Wait for the next text message from the client.
    ///
    /// Returns `None` once the client closed or dropped the connection.
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.from_client.recv().await?;
        self.take_text(frame)
    }

    /// Take a text message from the client if one is waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        let frame = self.from_client.try_recv().ok()?;
        self.take_text(frame)
    }

    /// Get the reason the client gave when it closed, once seen by
    /// [`recv`](Self::recv).
    #[must_use]
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    fn take_text(&mut self, frame: ClientFrame) -> Option<String> {
        match frame {
            ClientFrame::Text(text) => Some(text),
            ClientFrame::Close(reason) => {
                self.close_reason = Some(reason);
                None
            }
        }
    }

    /// Whether the client closed or dropped its end.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}
