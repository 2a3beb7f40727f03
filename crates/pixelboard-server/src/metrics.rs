//! Metrics collection and export for pixelboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "pixelboard_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "pixelboard_sessions_active";
    pub const EDITS_TOTAL: &str = "pixelboard_edits_total";
    pub const EDIT_LATENCY_SECONDS: &str = "pixelboard_edit_latency_seconds";
    pub const UPDATES_SENT_TOTAL: &str = "pixelboard_updates_sent_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "pixelboard_subscriptions_active";
    pub const ERRORS_TOTAL: &str = "pixelboard_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of live sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(names::EDITS_TOTAL, "Edits submitted, by outcome");
    metrics::describe_histogram!(
        names::EDIT_LATENCY_SECONDS,
        "Time to validate and commit an edit in seconds"
    );
    metrics::describe_counter!(
        names::UPDATES_SENT_TOTAL,
        "Pixel updates pushed to clients"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of canvas subscriptions"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a new session.
pub fn record_session() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record the end of a session.
pub fn record_session_end() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a submitted edit.
pub fn record_edit(outcome: &'static str, seconds: f64) {
    counter!(names::EDITS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::EDIT_LATENCY_SECONDS).record(seconds);
}

/// Record a pixel update pushed to a client.
pub fn record_update_sent() {
    counter!(names::UPDATES_SENT_TOTAL).increment(1);
}

/// Update the active subscription count.
pub fn set_active_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the end of a session on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        record_session();
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        record_session_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Without an installed recorder these are no-ops.
        let _guard = SessionMetricsGuard::new();
        record_edit("accepted", 0.001);
        record_error("storage");
    }
}
