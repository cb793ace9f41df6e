//! Editing presence.
//!
//! Tracks which user is currently editing which order, derived from the
//! update events of the order feed. A record lives for a fixed window after
//! the last update touching the order; every new update restarts the window.
//! Updates made by the local user are ignored, a user never sees themself as
//! an editor.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shopfloor_protocol::Envelope;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default editing window.
pub const DEFAULT_EDITING_TIMEOUT: Duration = Duration::from_secs(30);

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Who is editing an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingRecord {
    /// Order being edited.
    pub entity_id: i64,
    /// Editing user.
    pub user_id: i64,
    /// Display name of the editing user.
    pub username: String,
    /// Last update seen (ms since the Unix epoch).
    pub last_activity_at: u64,
}

/// Change to the presence table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// An order gained an editor.
    Started(EditingRecord),
    /// An editor touched the order again, possibly a different user.
    Refreshed(EditingRecord),
    /// An order has no editor anymore.
    Cleared {
        /// Order that was released.
        entity_id: i64,
    },
}

struct Entry {
    record: EditingRecord,
    touched: Instant,
    generation: u64,
    expiry: JoinHandle<()>,
}

struct Inner {
    entries: DashMap<i64, Entry>,
    timeout: Duration,
    local_user: RwLock<Option<i64>>,
    generation: AtomicU64,
    changes: broadcast::Sender<PresenceChange>,
}

impl Inner {
    fn expire(&self, entity_id: i64, generation: u64) {
        if self
            .entries
            .remove_if(&entity_id, |_, entry| entry.generation == generation)
            .is_some()
        {
            debug!(entity_id, "Editing presence expired");
            let _ = self.changes.send(PresenceChange::Cleared { entity_id });
        }
    }

    fn is_live(&self, entry: &Entry) -> bool {
        entry.touched.elapsed() < self.timeout
    }
}

/// Time-bounded map of orders to their current editor.
///
/// Must be used inside a tokio runtime; each record owns an expiry task.
pub struct EditingTable {
    inner: Arc<Inner>,
}

impl EditingTable {
    /// Create a table with the default 30 s window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_EDITING_TIMEOUT)
    }

    /// Create a table with a custom window.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                timeout,
                local_user: RwLock::new(None),
                generation: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Get the editing window.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Set the id of the local user.
    ///
    /// Records already held for that user are dropped.
    pub fn set_local_user(&self, user_id: Option<i64>) {
        *self
            .inner
            .local_user
            .write()
            .unwrap_or_else(PoisonError::into_inner) = user_id;

        if let Some(user_id) = user_id {
            let own: Vec<i64> = self
                .inner
                .entries
                .iter()
                .filter(|entry| entry.record.user_id == user_id)
                .map(|entry| *entry.key())
                .collect();
            for entity_id in own {
                self.clear(entity_id);
            }
        }
    }

    /// Get the id of the local user.
    #[must_use]
    pub fn local_user(&self) -> Option<i64> {
        *self
            .inner
            .local_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one inbound event.
    ///
    /// Returns `true` if the event created or refreshed a record.
    pub fn observe(&self, envelope: &Envelope) -> bool {
        if !envelope.event_kind().is_entity_update() {
            return false;
        }
        let (Some(entity_id), Some(user_id)) = (envelope.entity_id(), envelope.acting_user_id())
        else {
            trace!(kind = %envelope.kind, "Update without order or user, ignoring");
            return false;
        };
        if self.local_user() == Some(user_id) {
            return false;
        }

        let username = envelope
            .acting_username()
            .map_or_else(|| format!("User {user_id}"), str::to_string);
        self.touch(EditingRecord {
            entity_id,
            user_id,
            username,
            last_activity_at: crate::now_ms(),
        });
        true
    }

    fn touch(&self, record: EditingRecord) {
        let entity_id = record.entity_id;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let expiry = spawn_expiry(Arc::downgrade(&self.inner), entity_id, generation);

        let entry = Entry {
            record: record.clone(),
            touched: Instant::now(),
            generation,
            expiry,
        };

        let previous = self.inner.entries.insert(entity_id, entry);
        let change = match previous {
            Some(previous) => {
                previous.expiry.abort();
                if self.inner.is_live(&previous) {
                    PresenceChange::Refreshed(record)
                } else {
                    PresenceChange::Started(record)
                }
            }
            None => PresenceChange::Started(record),
        };

        trace!(entity_id, generation, "Editing presence touched");
        let _ = self.inner.changes.send(change);
    }

    /// Get the current editor of an order.
    #[must_use]
    pub fn editing_user(&self, entity_id: i64) -> Option<EditingRecord> {
        self.inner
            .entries
            .get(&entity_id)
            .filter(|entry| self.inner.is_live(entry))
            .map(|entry| entry.record.clone())
    }

    /// Whether someone else is editing an order.
    #[must_use]
    pub fn is_being_edited(&self, entity_id: i64) -> bool {
        self.editing_user(entity_id).is_some()
    }

    /// Get every live record, ordered by order id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EditingRecord> {
        let mut records: Vec<EditingRecord> = self
            .inner
            .entries
            .iter()
            .filter(|entry| self.inner.is_live(entry))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.entity_id);
        records
    }

    /// Get the number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| self.inner.is_live(entry))
            .count()
    }

    /// Whether no order is being edited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the record of an order, cancelling its expiry.
    pub fn clear(&self, entity_id: i64) -> bool {
        match self.inner.entries.remove(&entity_id) {
            Some((_, entry)) => {
                entry.expiry.abort();
                let _ = self.inner.changes.send(PresenceChange::Cleared { entity_id });
                true
            }
            None => false,
        }
    }

    /// Drop every record.
    pub fn clear_all(&self) {
        let ids: Vec<i64> = self.inner.entries.iter().map(|entry| *entry.key()).collect();
        for entity_id in ids {
            self.clear(entity_id);
        }
    }

    /// Subscribe to table changes.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.inner.changes.subscribe()
    }
}

impl Default for EditingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EditingTable {
    fn drop(&mut self) {
        for entry in self.inner.entries.iter() {
            entry.expiry.abort();
        }
    }
}

impl std::fmt::Debug for EditingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditingTable")
            .field("records", &self.inner.entries.len())
            .field("timeout", &self.inner.timeout)
            .field("local_user", &self.local_user())
            .finish()
    }
}

fn spawn_expiry(inner: Weak<Inner>, entity_id: i64, generation: u64) -> JoinHandle<()> {
    let timeout = inner
        .upgrade()
        .map_or(DEFAULT_EDITING_TIMEOUT, |inner| inner.timeout);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(entity_id, generation);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_updated(order_id: i64, user_id: i64, username: &str) -> Envelope {
        Envelope::new("order_updated").with_field(
            "order",
            json!({"id": order_id, "user_id": user_id, "username": username}),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_after_window() {
        let table = EditingTable::new();
        assert!(table.observe(&order_updated(7, 3, "ana")));

        tokio::time::advance(Duration::from_secs(29)).await;
        let record = table.editing_user(7).unwrap();
        assert_eq!(record.user_id, 3);
        assert_eq!(record.username, "ana");

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(table.editing_user(7).is_none());
        assert!(!table.is_being_edited(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_restarts_window() {
        let table = EditingTable::new();
        table.observe(&order_updated(7, 3, "ana"));

        tokio::time::advance(Duration::from_secs(20)).await;
        table.observe(&order_updated(7, 3, "ana"));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(table.is_being_edited(7));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!table.is_being_edited(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_user_filtered() {
        let table = EditingTable::new();
        table.set_local_user(Some(3));

        assert!(!table.observe(&order_updated(7, 3, "ana")));
        assert!(table.editing_user(7).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setting_local_user_drops_own_records() {
        let table = EditingTable::new();
        table.observe(&order_updated(7, 3, "ana"));
        table.observe(&order_updated(8, 4, "rui"));

        table.set_local_user(Some(3));
        assert!(table.editing_user(7).is_none());
        assert!(table.is_being_edited(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallbacks() {
        let table = EditingTable::new();

        // Top-level ids, no username
        let envelope = Envelope::new("order_status_updated")
            .with_field("order_id", json!(12))
            .with_field("user_id", json!(5));
        assert!(table.observe(&envelope));
        assert_eq!(table.editing_user(12).unwrap().username, "User 5");

        // Other kinds never create presence
        assert!(!table.observe(&Envelope::new("order_created").with_field(
            "order",
            json!({"id": 13, "user_id": 5})
        )));
        // Missing user id
        assert!(!table.observe(&Envelope::new("order_updated").with_field("order_id", json!(14))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_changes() {
        let table = EditingTable::new();
        let mut changes = table.changes();

        table.observe(&order_updated(7, 3, "ana"));
        table.observe(&order_updated(7, 4, "rui"));
        assert!(table.clear(7));
        assert!(!table.clear(7));

        assert!(matches!(
            changes.recv().await.unwrap(),
            PresenceChange::Started(r) if r.user_id == 3
        ));
        assert!(matches!(
            changes.recv().await.unwrap(),
            PresenceChange::Refreshed(r) if r.user_id == 4
        ));
        assert_eq!(
            changes.recv().await.unwrap(),
            PresenceChange::Cleared { entity_id: 7 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_task_emits_cleared() {
        let table = EditingTable::with_timeout(Duration::from_secs(5));
        let mut changes = table.changes();
        table.observe(&order_updated(1, 2, "bia"));
        let _ = changes.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            changes.recv().await.unwrap(),
            PresenceChange::Cleared { entity_id: 1 }
        );
        assert!(table.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_sorted() {
        let table = EditingTable::new();
        table.observe(&order_updated(9, 1, "a"));
        table.observe(&order_updated(2, 1, "a"));
        table.observe(&order_updated(5, 1, "a"));

        let ids: Vec<i64> = table.snapshot().iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);

        table.clear_all();
        assert!(table.is_empty());
    }
}
