//! Listener registry and fan-out.
//!
//! Listeners are plain callbacks identified by the order in which they were
//! registered. Dispatch delivers a message to every listener in that order and
//! isolates failures: a panicking listener is logged and skipped, the rest
//! still receive the message.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, trace};

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identity of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Get the raw id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that returned normally.
    pub delivered: usize,
    /// Listeners that panicked.
    pub failed: usize,
}

/// Ordered set of listeners.
pub struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> ListenerRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener, returning its id.
    pub fn register<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_arc(Arc::new(listener))
    }

    /// Register an already shared listener.
    pub fn register_arc(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.lock();
        listeners.push((id, listener));
        trace!(listener = %id, total = listeners.len(), "Listener registered");
        id
    }

    /// Remove a listener.
    ///
    /// Returns `true` if the listener was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            trace!(listener = %id, total = listeners.len(), "Listener unregistered");
        }
        removed
    }

    /// Deliver a message to every listener in registration order.
    ///
    /// The registry lock is not held while listeners run, so a listener may
    /// register or unregister other listeners; such changes apply to the next
    /// dispatch.
    pub fn dispatch(&self, message: &T) -> DispatchReport {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self.lock().clone();
        let mut report = DispatchReport::default();

        for (id, listener) in snapshot {
            if invoke_guarded(id, listener.as_ref(), message) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Get the number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Check if a listener is registered.
    #[must_use]
    pub fn contains(&self, id: ListenerId) -> bool {
        self.lock().iter().any(|(existing, _)| *existing == id)
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        // Listeners never run under this lock, so a poisoned guard still holds
        // a consistent list.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Run one listener, containing any panic.
///
/// Returns `false` if the listener panicked.
pub fn invoke_guarded<T>(
    id: ListenerId,
    listener: &(dyn Fn(&T) + Send + Sync),
    message: &T,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| listener(message))) {
        Ok(()) => true,
        Err(panic) => {
            error!(listener = %id, panic = %panic_message(&*panic), "Listener panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
