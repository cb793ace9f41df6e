//! Host bridge.
//!
//! The secondary notification channel does not own a socket. It talks to the
//! host process through request/response commands and receives pushed events
//! on named event streams. [`HostBridge`] is that seam; [`MemoryBridge`] is a
//! scripted host for tests and demos.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Host bridge errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The host rejected or failed a command.
    #[error("Command {command} failed: {message}")]
    Invoke {
        /// Command name.
        command: String,
        /// Host message.
        message: String,
    },

    /// Listening to an event stream failed.
    #[error("Failed to listen to {0}")]
    Listen(String),

    /// The host is not reachable.
    #[error("Host bridge unavailable")]
    Unavailable,
}

/// Request/response and push-event access to the host process.
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// Run a host command on behalf of a client.
    async fn invoke(&self, command: &str, client_id: &str) -> Result<String, BridgeError>;

    /// Start receiving payloads pushed on `event`.
    ///
    /// Dropping the receiver detaches the listener.
    async fn listen(&self, event: &str) -> Result<mpsc::UnboundedReceiver<Bytes>, BridgeError>;
}

/// A recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCall {
    /// Command name.
    pub command: String,
    /// Client the command was issued for.
    pub client_id: String,
}

#[derive(Default)]
struct BridgeState {
    failures: HashMap<String, u32>,
    calls: Vec<BridgeCall>,
    listeners: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    unavailable: bool,
}

/// In-process host with scripted failures.
#[derive(Default)]
pub struct MemoryBridge {
    state: Mutex<BridgeState>,
}

impl MemoryBridge {
    /// Create a host that accepts every command.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` invocations of `command`.
    pub fn fail_next(&self, command: &str, times: u32) {
        self.lock().failures.insert(command.to_string(), times);
    }

    /// Make every command and listen call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Get every invocation so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BridgeCall> {
        self.lock().calls.clone()
    }

    /// Count invocations of a command.
    #[must_use]
    pub fn call_count(&self, command: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    /// Push a payload on an event stream.
    ///
    /// Returns `false` if nobody listens.
    pub fn emit(&self, event: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.lock();
        match state.listeners.get(event) {
            Some(sender) => sender.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Whether a live listener is attached to `event`.
    #[must_use]
    pub fn is_listening(&self, event: &str) -> bool {
        self.lock()
            .listeners
            .get(event)
            .is_some_and(|sender| !sender.is_closed())
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HostBridge for MemoryBridge {
    async fn invoke(&self, command: &str, client_id: &str) -> Result<String, BridgeError> {
        let mut state = self.lock();
        state.calls.push(BridgeCall {
            command: command.to_string(),
            client_id: client_id.to_string(),
        });
        trace!(command, client_id, "Bridge command invoked");

        if state.unavailable {
            return Err(BridgeError::Unavailable);
        }
        if let Some(remaining) = state.failures.get_mut(command) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BridgeError::Invoke {
                    command: command.to_string(),
                    message: "scripted failure".to_string(),
                });
            }
        }
        Ok("ok".to_string())
    }

    async fn listen(&self, event: &str) -> Result<mpsc::UnboundedReceiver<Bytes>, BridgeError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(BridgeError::Listen(event.to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.listeners.insert(event.to_string(), sender);
        Ok(receiver)
    }
}

impl std::fmt::Debug for MemoryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBridge")
            .field("calls", &state.calls.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
