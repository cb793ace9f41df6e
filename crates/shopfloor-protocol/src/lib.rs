//! # shopfloor-protocol
//!
//! Wire messages exchanged with the Shopfloor backend.
//!
//! The order feed speaks small JSON documents over a WebSocket:
//!
//! - **Envelope** - every inbound event; only `type` is required
//! - **ControlFrame** - client-originated `authenticate` and `ping` frames
//! - **OrderNotification** - payload of the host-bridged notification channel
//!
//! ## Example
//!
//! ```rust
//! use shopfloor_protocol::{codec, EventKind};
//!
//! let raw = br#"{"type":"order_updated","order":{"id":7,"user_id":3}}"#;
//! let envelope = codec::decode_envelope(raw).unwrap();
//!
//! assert_eq!(envelope.event_kind(), EventKind::OrderUpdated);
//! assert_eq!(envelope.entity_id(), Some(7));
//! ```

pub mod codec;
pub mod control;
pub mod envelope;
pub mod notification;

pub use codec::{
    decode_envelope, decode_envelope_limited, decode_notification, encode_control, ProtocolError,
};
pub use control::ControlFrame;
pub use envelope::{Envelope, EventKind};
pub use notification::{ClientIdentity, NotificationType, OrderNotification};
