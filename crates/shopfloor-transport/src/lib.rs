//! # shopfloor-transport
//!
//! Transport abstraction layer for the Shopfloor realtime client.
//!
//! - **WebSocket** - the order feed over `ws://`/`wss://`
//! - **Memory** - a scripted in-process server for deterministic tests
//! - **Bridge** - command/event access to the host process, used by the
//!   notification channel
//!
//! ## Transport Abstraction
//!
//! Transports implement [`Connector`] and [`Connection`], so the connection
//! manager is protocol-agnostic.
//!
//! ```rust,ignore
//! use shopfloor_transport::{Connection, Connector, Inbound};
//!
//! async fn tail(connector: &dyn Connector, url: &str) {
//!     let mut conn = connector.connect(url).await.unwrap();
//!     while let Ok(Inbound::Message(data)) = conn.recv().await {
//!         // Process message
//!     }
//! }
//! ```

pub mod bridge;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bridge::{BridgeCall, BridgeError, HostBridge, MemoryBridge};
pub use memory::{MemoryConnector, MemoryPeer, MemoryServer, PendingConnection};
pub use traits::{checked_message, CloseReason, Connection, Connector, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
