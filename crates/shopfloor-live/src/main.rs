//! # shopfloor-tail
//!
//! Follows the order feed and logs events, status changes and editing
//! presence.
//!
//! ## Usage
//!
//! ```bash
//! # Use shopfloor.toml from the usual locations
//! shopfloor-tail
//!
//! # Use a specific config file
//! shopfloor-tail /path/to/shopfloor.toml
//!
//! # Configure through the environment
//! SHOPFLOOR_ENDPOINT__API_URL=https://erp.example.com/api shopfloor-tail
//! ```

use anyhow::Result;
use shopfloor_core::{PresenceChange, SessionSettings};
use shopfloor_live::{metrics, Config, ConnectionManager, PresenceTracker};
use shopfloor_transport::{WebSocketConfig, WebSocketConnector};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopfloor=debug,shopfloor_live=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let settings = Arc::new(SessionSettings::new(
        config.endpoint.api_url.clone(),
        config.session.token.clone(),
    ));
    let connector = WebSocketConnector::new(WebSocketConfig {
        max_message_size: config.connection.max_message_size,
    });
    let manager = ConnectionManager::spawn(config.manager(), Arc::new(connector), settings);

    let _status = manager.on_status(|status| {
        info!(
            connected = status.connected,
            phase = %status.phase,
            reconnect_attempts = status.reconnect_attempts,
            error = status.last_error.as_deref().unwrap_or(""),
            "Status"
        );
    });
    let _events = manager
        .subscribe(|event| {
            info!(kind = %event.kind, order_id = ?event.entity_id(), "Event");
        })
        .await;

    let presence = PresenceTracker::new(config.editing_timeout());
    presence.set_local_user(config.session.user_id);
    presence.attach(&manager).await;

    let mut changes = presence.changes();
    let log_presence = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(PresenceChange::Started(record) | PresenceChange::Refreshed(record)) => {
                    info!(
                        order_id = record.entity_id,
                        user = %record.username,
                        "Order being edited"
                    );
                }
                Ok(PresenceChange::Cleared { entity_id }) => {
                    info!(order_id = entity_id, "Order released");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Presence log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    log_presence.abort();
    presence.shutdown().await;
    manager.disconnect().await;

    Ok(())
}
