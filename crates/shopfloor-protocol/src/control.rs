//! Client-originated control frames.

use serde::{Deserialize, Serialize};

/// A frame sent by the client on the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent once right after the connection opens, when a session exists.
    Authenticate {
        /// Session bearer token.
        token: String,
    },

    /// Keepalive ping.
    Ping {
        /// Client clock in milliseconds since the Unix epoch.
        timestamp: u64,
    },
}

impl ControlFrame {
    /// Create an Authenticate frame.
    #[must_use]
    pub fn authenticate(token: impl Into<String>) -> Self {
        ControlFrame::Authenticate {
            token: token.into(),
        }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping(timestamp: u64) -> Self {
        ControlFrame::Ping { timestamp }
    }
}
