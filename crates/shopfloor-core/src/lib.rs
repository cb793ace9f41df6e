//! # shopfloor-core
//!
//! Transport-independent building blocks of the Shopfloor realtime client.
//!
//! - **Registry** - ordered listener fan-out that survives panicking listeners
//! - **Status** - last known connection status and its observers
//! - **Presence** - time-bounded "who is editing which order" table
//! - **Endpoint** - resolution of the realtime URL from the API base URL
//! - **Policy** - retry cap and delay shared by both realtime channels
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│  Listeners  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │   Status    │     │  Presence   │
//! └─────────────┘     └─────────────┘
//! ```

pub mod endpoint;
pub mod policy;
pub mod presence;
pub mod registry;
pub mod status;

pub use endpoint::{
    resolve, Endpoint, EndpointError, EndpointSource, SessionSettings, DEFAULT_EVENTS_PATH,
};
pub use policy::{FailureTracker, RetryPolicy};
pub use presence::{EditingRecord, EditingTable, PresenceChange, DEFAULT_EDITING_TIMEOUT};
pub use registry::{DispatchReport, Listener, ListenerId, ListenerRegistry};
pub use status::{ConnectionPhase, StatusBroadcaster, StatusSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
