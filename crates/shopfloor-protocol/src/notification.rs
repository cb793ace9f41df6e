//! Host-bridged notification channel messages.
//!
//! The desktop host forwards order notifications to each registered client on
//! a push event whose name is derived from the client's identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Command that registers a client with the host.
pub const SUBSCRIBE_COMMAND: &str = "subscribe_to_notifications";

/// Command that removes a client registration.
pub const UNSUBSCRIBE_COMMAND: &str = "unsubscribe_from_notifications";

/// Command that keeps a registration alive.
pub const HEARTBEAT_COMMAND: &str = "send_heartbeat";

/// Prefix of the per-client push event name.
pub const EVENT_PREFIX: &str = "order-notification-";

/// Ensures identities generated within the same millisecond differ.
static IDENTITY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Kind of an order notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    OrderCreated,
    OrderUpdated,
    OrderDeleted,
    OrderStatusChanged,
    OrderStatusFlagsUpdated,
    Heartbeat,
    ClientConnected,
    ClientDisconnected,
    #[serde(other)]
    Unknown,
}

/// A notification pushed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNotification {
    pub notification_type: NotificationType,
    #[serde(default)]
    pub order_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_numero: Option<String>,
    /// RFC 3339 timestamp as produced by the host.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Client that caused the notification, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub broadcast_to_all: bool,
}

impl OrderNotification {
    /// Create a notification about an order.
    #[must_use]
    pub fn new(notification_type: NotificationType, order_id: i64) -> Self {
        Self {
            notification_type,
            order_id,
            order_numero: None,
            timestamp: String::new(),
            user_id: None,
            details: None,
            client_id: None,
            broadcast_to_all: true,
        }
    }

    /// Whether this is a keepalive notification.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.notification_type == NotificationType::Heartbeat
    }
}

/// Process-lifetime identity used to register with the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap an existing identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identity from the current time.
    #[must_use]
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let counter = IDENTITY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("shopfloor_{}", to_base36(millis.wrapping_add(counter))))
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the push event carrying this client's notifications.
    #[must_use]
    pub fn event_name(&self) -> String {
        format!("{EVENT_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
