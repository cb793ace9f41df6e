//! Connection status broadcasting.
//!
//! The broadcaster keeps the last known [`StatusSnapshot`]. Every change
//! produces a new snapshot which replaces the stored one and is pushed
//! synchronously to all observers.

use crate::registry::{invoke_guarded, Listener, ListenerId, ListenerRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Coarse lifecycle phase of the realtime connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No connection and none wanted.
    #[default]
    Idle,
    /// Transport handshake in progress.
    Connecting,
    /// Transport open.
    Open,
    /// Waiting for the reconnect delay to elapse.
    ReconnectScheduled,
    /// Failure cap reached; no automatic attempts until an explicit connect.
    Degraded,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::ReconnectScheduled => "reconnect_scheduled",
            ConnectionPhase::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Last known connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether the transport is open.
    pub connected: bool,
    /// Reconnects scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// When the last inbound message arrived (ms since the Unix epoch).
    pub last_event_at: Option<u64>,
    /// Most recent error, cleared by a successful open or message.
    pub last_error: Option<String>,
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
}

impl StatusSnapshot {
    /// The status of a manager that has never connected.
    #[must_use]
    pub fn initial() -> Self {
        Self::default()
    }
}

/// Holder of the current status plus its observers.
pub struct StatusBroadcaster {
    current: watch::Sender<StatusSnapshot>,
    observers: ListenerRegistry<StatusSnapshot>,
}

impl StatusBroadcaster {
    /// Create a broadcaster holding the initial status.
    #[must_use]
    pub fn new() -> Self {
        let (current, _) = watch::channel(StatusSnapshot::initial());
        Self {
            current,
            observers: ListenerRegistry::new(),
        }
    }

    /// Get a copy of the current status.
    #[must_use]
    pub fn current(&self) -> StatusSnapshot {
        self.current.borrow().clone()
    }

    /// Get a receiver that is notified of every change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.current.subscribe()
    }

    /// Register an observer.
    ///
    /// The observer is invoked once right away with the current status, then
    /// after every change.
    pub fn observe<F>(&self, observer: F) -> ListenerId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let observer: Listener<StatusSnapshot> = Arc::new(observer);
        let id = self.observers.register_arc(Arc::clone(&observer));
        invoke_guarded(id, observer.as_ref(), &self.current());
        id
    }

    /// Remove an observer.
    pub fn unobserve(&self, id: ListenerId) -> bool {
        self.observers.unregister(id)
    }

    /// Get the number of observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Derive the next status from the current one.
    ///
    /// Observers are only notified when the result differs. Returns whether
    /// the status changed.
    pub fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut next = self.current();
        change(&mut next);
        if *self.current.borrow() == next {
            return false;
        }

        trace!(
            connected = next.connected,
            phase = %next.phase,
            attempts = next.reconnect_attempts,
            "Status changed"
        );
        self.current.send_replace(next.clone());
        self.observers.dispatch(&next);
        true
    }

    /// Restore the initial status.
    pub fn reset(&self) -> bool {
        self.update(|status| *status = StatusSnapshot::initial())
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBroadcaster")
            .field("current", &*self.current.borrow())
            .field("observers", &self.observers.len())
            .finish()
    }
}
