//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "relay_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const GROUPS_ACTIVE: &str = "relay_groups_active";
    pub const TRANSFERS_TOTAL: &str = "relay_transfers_total";
    pub const TRANSFER_BYTES: &str = "relay_transfer_bytes";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of monitored connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of commands dispatched");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of registered sessions");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of non-empty groups");
    metrics::describe_counter!(
        names::TRANSFERS_TOTAL,
        "File transfers by mode and outcome"
    );
    metrics::describe_histogram!(names::TRANSFER_BYTES, "Bytes sent per file transfer");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a connection refused for capacity.
pub fn record_rejection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a dispatched command.
pub fn record_message(command: &'static str) {
    counter!(names::MESSAGES_TOTAL, "command" => command).increment(1);
}

/// Update session and group gauges.
pub fn set_table_sizes(sessions: usize, groups: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(sessions as f64);
    gauge!(names::GROUPS_ACTIVE).set(groups as f64);
}

/// Record the end of a file transfer.
pub fn record_transfer(mode: &'static str, outcome: &'static str, bytes: u64) {
    counter!(names::TRANSFERS_TOTAL, "mode" => mode, "outcome" => outcome).increment(1);
    histogram!(names::TRANSFER_BYTES, "mode" => mode).record(bytes as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records a connection and its disconnection on drop.
#[derive(Debug)]
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
