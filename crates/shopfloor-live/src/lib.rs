//! # shopfloor-live
//!
//! Realtime client of the Shopfloor order feed.
//!
//! - **Manager** - the single feed connection: reconnects, keep-alive,
//!   fan-out to listeners and status reporting
//! - **Presence** - who is editing which order, derived from the feed
//! - **Notifications** - the host-bridged notification channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use shopfloor_live::{ConnectionManager, ManagerConfig};
//! use shopfloor_core::SessionSettings;
//! use shopfloor_transport::WebSocketConnector;
//! use std::sync::Arc;
//!
//! let settings = Arc::new(SessionSettings::new(Some("https://erp.example.com".into()), None));
//! let manager = ConnectionManager::spawn(
//!     ManagerConfig::default(),
//!     Arc::new(WebSocketConnector::default()),
//!     settings,
//! );
//! let _subscription = manager
//!     .subscribe(|event| println!("{}", event.kind))
//!     .await;
//! ```

pub mod config;
pub mod manager;
pub mod metrics;
pub mod notifications;
pub mod presence;

pub use config::Config;
pub use manager::{
    global, install_global, ConnectionManager, ManagerConfig, StatusSubscription, Subscription,
};
pub use notifications::{ChannelConfig, ChannelStatus, NotificationChannel};
pub use presence::PresenceTracker;
