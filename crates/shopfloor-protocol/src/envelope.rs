//! Inbound event envelope.
//!
//! The backend pushes loosely structured JSON events. Only the `type` field is
//! enforced; everything else is kept verbatim and read through accessors so
//! that new fields or event kinds never break decoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Known event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderCreated,
    OrderUpdated,
    OrderStatusUpdated,
    OrderDeleted,
    Heartbeat,
    Pong,
    ClientConnected,
    ClientDisconnected,
    /// Any type this client does not interpret.
    Other,
}

impl EventKind {
    /// Map a wire `type` string to a kind.
    #[must_use]
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "order_created" | "pedido_criado" => EventKind::OrderCreated,
            "order_updated" | "pedido_atualizado" => EventKind::OrderUpdated,
            "order_status_updated" | "order_status_changed" => EventKind::OrderStatusUpdated,
            "order_deleted" | "order_canceled" | "pedido_cancelado" => EventKind::OrderDeleted,
            "heartbeat" => EventKind::Heartbeat,
            "pong" => EventKind::Pong,
            "client_connected" => EventKind::ClientConnected,
            "client_disconnected" => EventKind::ClientDisconnected,
            _ => EventKind::Other,
        }
    }

    /// Whether this kind means "someone changed this order".
    #[must_use]
    pub fn is_entity_update(self) -> bool {
        matches!(self, EventKind::OrderUpdated | EventKind::OrderStatusUpdated)
    }
}

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type as sent by the backend.
    #[serde(rename = "type")]
    pub kind: String,
    /// All remaining fields, untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no extra fields.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Get the interpreted event kind.
    #[must_use]
    pub fn event_kind(&self) -> EventKind {
        EventKind::from_type(&self.kind)
    }

    /// Get a raw field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The embedded order object, if present.
    #[must_use]
    pub fn order(&self) -> Option<&Map<String, Value>> {
        self.fields.get("order").and_then(Value::as_object)
    }

    /// The top-level `order_id` (or `pedido_id`), if present and numeric.
    #[must_use]
    pub fn order_id(&self) -> Option<i64> {
        self.fields
            .get("order_id")
            .and_then(as_id)
            .or_else(|| self.fields.get("pedido_id").and_then(as_id))
    }

    /// Id of the order this event is about.
    ///
    /// Prefers `order.id` and falls back to `order_id`, then `pedido_id`.
    #[must_use]
    pub fn entity_id(&self) -> Option<i64> {
        self.order()
            .and_then(|order| order.get("id"))
            .and_then(as_id)
            .or_else(|| self.order_id())
    }

    /// Id of the user who caused this event (`order.user_id` or `user_id`).
    #[must_use]
    pub fn acting_user_id(&self) -> Option<i64> {
        self.order()
            .and_then(|order| order.get("user_id"))
            .and_then(as_id)
            .or_else(|| self.fields.get("user_id").and_then(as_id))
    }

    /// Name of the user who caused this event (`order.username` or `username`).
    #[must_use]
    pub fn acting_username(&self) -> Option<&str> {
        self.order()
            .and_then(|order| order.get("username"))
            .and_then(Value::as_str)
            .or_else(|| self.fields.get("username").and_then(Value::as_str))
            .filter(|name| !name.is_empty())
    }
}

/// Ids arrive as JSON numbers, occasionally as numeric strings.
fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
