//! Editing presence fed by the order feed.

use shopfloor_core::{EditingRecord, EditingTable, PresenceChange};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::manager::{ConnectionManager, Subscription};

/// Keeps an [`EditingTable`] up to date from a [`ConnectionManager`].
///
/// One tracker per process is enough; every screen reads the same table.
pub struct PresenceTracker {
    table: Arc<EditingTable>,
    subscription: Mutex<Option<Subscription>>,
}

impl PresenceTracker {
    /// Create a detached tracker with the given editing window.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(EditingTable::with_timeout(timeout)),
            subscription: Mutex::new(None),
        }
    }

    /// Start following the feed of `manager`.
    ///
    /// Subscribes once; further calls return `false` and change nothing.
    pub async fn attach(&self, manager: &ConnectionManager) -> bool {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return false;
        }

        let table = Arc::clone(&self.table);
        *subscription = Some(
            manager
                .subscribe(move |envelope| {
                    table.observe(envelope);
                })
                .await,
        );
        debug!("Presence tracker attached");
        true
    }

    /// Stop following the feed and forget every record.
    pub async fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.unsubscribe().await;
        }
        self.table.clear_all();
        debug!("Presence tracker shut down");
    }

    /// Whether the tracker follows a feed.
    pub async fn is_attached(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Set the logged-in user, whose own edits are never shown.
    pub fn set_local_user(&self, user_id: Option<i64>) {
        self.table.set_local_user(user_id);
    }

    /// Get the current editor of an order.
    #[must_use]
    pub fn editing_user(&self, entity_id: i64) -> Option<EditingRecord> {
        self.table.editing_user(entity_id)
    }

    /// Whether another user is editing an order.
    #[must_use]
    pub fn is_being_edited(&self, entity_id: i64) -> bool {
        self.table.is_being_edited(entity_id)
    }

    /// Get every current editor.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EditingRecord> {
        self.table.snapshot()
    }

    /// Subscribe to presence changes.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.table.changes()
    }

    /// Get the underlying table.
    #[must_use]
    pub fn table(&self) -> &EditingTable {
        &self.table
    }
}
