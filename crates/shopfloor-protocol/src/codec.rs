//! JSON codec for the order feed.
//!
//! Inbound payloads are accepted as raw bytes (text and binary WebSocket
//! messages are treated alike); outbound control frames are encoded as text.

use bytes::Bytes;
use thiserror::Error;

use crate::control::ControlFrame;
use crate::envelope::Envelope;
use crate::notification::OrderNotification;

/// Default maximum inbound message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Received size.
        size: usize,
        /// Limit in force.
        max: usize,
    },

    /// Message carried no data.
    #[error("Empty message")]
    Empty,

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound event.
///
/// # Errors
///
/// Returns an error if the payload is empty, too large, not JSON, or lacks a
/// `type` field.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_envelope_limited(data, MAX_MESSAGE_SIZE)
}

/// Decode an inbound event, accepting at most `max` bytes.
///
/// # Errors
///
/// Same as [`decode_envelope`], with `max` as the size limit.
pub fn decode_envelope_limited(data: &[u8], max: usize) -> Result<Envelope, ProtocolError> {
    check_size(data, max)?;
    Ok(serde_json::from_slice(data)?)
}

/// Decode a host notification.
///
/// # Errors
///
/// Returns an error if the payload is empty, too large, or malformed.
pub fn decode_notification(data: &[u8]) -> Result<OrderNotification, ProtocolError> {
    check_size(data, MAX_MESSAGE_SIZE)?;
    Ok(serde_json::from_slice(data)?)
}

/// Encode a control frame to its text form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_control(frame: &ControlFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode a notification, as the host would push it.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_notification(notification: &OrderNotification) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(notification)?))
}

/// Whether a payload holds nothing but whitespace.
#[must_use]
pub fn is_blank(data: &[u8]) -> bool {
    data.iter().all(u8::is_ascii_whitespace)
}

fn check_size(data: &[u8], max: usize) -> Result<(), ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max,
        });
    }
    if is_blank(data) {
        return Err(ProtocolError::Empty);
    }
    Ok(())
}
