//! Metrics for the realtime client.
//!
//! Uses the `metrics` crate for instrumentation; the binary can export them
//! in Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "shopfloor_messages_total";
    pub const DECODE_ERRORS_TOTAL: &str = "shopfloor_decode_errors_total";
    pub const LISTENER_FAILURES_TOTAL: &str = "shopfloor_listener_failures_total";
    pub const CONNECTIONS_OPENED_TOTAL: &str = "shopfloor_connections_opened_total";
    pub const RECONNECTS_SCHEDULED_TOTAL: &str = "shopfloor_reconnects_scheduled_total";
    pub const CONNECTED: &str = "shopfloor_connected";
    pub const HEARTBEATS_TOTAL: &str = "shopfloor_heartbeats_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Inbound messages received by channel");
    metrics::describe_counter!(
        names::DECODE_ERRORS_TOTAL,
        "Inbound messages dropped because they could not be decoded"
    );
    metrics::describe_counter!(
        names::LISTENER_FAILURES_TOTAL,
        "Listener invocations that panicked"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_OPENED_TOTAL,
        "Connections successfully opened"
    );
    metrics::describe_counter!(
        names::RECONNECTS_SCHEDULED_TOTAL,
        "Reconnect attempts scheduled after a failure"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the channel is connected");
    metrics::describe_counter!(names::HEARTBEATS_TOTAL, "Heartbeats sent, by outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an inbound message.
pub fn record_message(channel: &'static str) {
    counter!(names::MESSAGES_TOTAL, "channel" => channel).increment(1);
}

/// Record an undecodable message.
pub fn record_decode_error(channel: &'static str) {
    counter!(names::DECODE_ERRORS_TOTAL, "channel" => channel).increment(1);
}

/// Record panicking listeners.
pub fn record_listener_failures(count: usize) {
    if count > 0 {
        counter!(names::LISTENER_FAILURES_TOTAL).increment(count as u64);
    }
}

/// Record an opened connection.
pub fn record_connection_opened(channel: &'static str) {
    counter!(names::CONNECTIONS_OPENED_TOTAL, "channel" => channel).increment(1);
    gauge!(names::CONNECTED, "channel" => channel).set(1.0);
}

/// Record a lost or closed connection.
pub fn record_connection_closed(channel: &'static str) {
    gauge!(names::CONNECTED, "channel" => channel).set(0.0);
}

/// Record a scheduled reconnect.
pub fn record_reconnect_scheduled(channel: &'static str) {
    counter!(names::RECONNECTS_SCHEDULED_TOTAL, "channel" => channel).increment(1);
}

/// Record a heartbeat.
pub fn record_heartbeat(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(names::HEARTBEATS_TOTAL, "outcome" => outcome).increment(1);
}
