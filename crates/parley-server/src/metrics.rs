//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_protocol::ErrorKind;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
    pub const HANDSHAKE_FAILURES: &str = "parley_handshake_failures_total";
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const MESSAGES_CREATED: &str = "parley_messages_created_total";
    pub const DELIVERIES_TOTAL: &str = "parley_live_deliveries_total";
    pub const LATENCY_SECONDS: &str = "parley_handler_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of authenticated sessions"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_FAILURES,
        "Connections closed before authenticating"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::MESSAGES_CREATED, "Messages stored");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Frames pushed to live sessions by the delivery router"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Request handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a stored message and how many live sessions it reached.
pub fn record_message(live_deliveries: usize) {
    counter!(names::MESSAGES_CREATED).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(live_deliveries as u64);
}

/// Record request latency.
pub fn record_latency(request: &'static str, seconds: f64) {
    histogram!(names::LATENCY_SECONDS, "request" => request).record(seconds);
}

/// Record an error returned to a client.
pub fn record_error(kind: ErrorKind) {
    counter!(names::ERRORS_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record a socket that never authenticated.
pub fn record_handshake_failure() {
    counter!(names::HANDSHAKE_FAILURES).increment(1);
}

/// Update the live session gauge.
pub fn set_active_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Metrics guard that records disconnection on drop.
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
