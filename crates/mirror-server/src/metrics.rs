//! Metrics collection and export for Call Mirror.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use callmirror_core::{AuthError, DispatchOutcome, RemoteDelivery};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "mirror_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "mirror_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "mirror_auth_failures_total";
    pub const EVENTS_TOTAL: &str = "mirror_events_total";
    pub const EVENTS_BYTES: &str = "mirror_events_bytes";
    pub const ROUTING_ERRORS_TOTAL: &str = "mirror_routing_errors_total";
    pub const BUS_PUBLISHED_TOTAL: &str = "mirror_bus_published_total";
    pub const BUS_RECEIVED_TOTAL: &str = "mirror_bus_received_total";
    pub const BUS_ERRORS_TOTAL: &str = "mirror_bus_errors_total";
    pub const PRESENCE_ONLINE: &str = "mirror_presence_online";
    pub const LATENCY_SECONDS: &str = "mirror_latency_seconds";
    pub const ERRORS_TOTAL: &str = "mirror_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Handshakes rejected by token verification"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events processed, by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Bytes of events processed");
    metrics::describe_counter!(
        names::ROUTING_ERRORS_TOTAL,
        "Call events rejected with call:error, by code"
    );
    metrics::describe_counter!(names::BUS_PUBLISHED_TOTAL, "Envelopes published on the bus");
    metrics::describe_counter!(
        names::BUS_RECEIVED_TOTAL,
        "Envelopes received from the bus, by outcome"
    );
    metrics::describe_counter!(names::BUS_ERRORS_TOTAL, "Failed bus publishes");
    metrics::describe_gauge!(
        names::PRESENCE_ONLINE,
        "Identities held by this instance"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a rejected handshake.
pub fn record_auth_failure(error: &AuthError) {
    let reason = match error {
        AuthError::Missing => "missing",
        AuthError::Invalid(_) => "invalid",
        AuthError::Expired => "expired",
    };
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record an event crossing the socket.
pub fn record_event(event: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record what the router did with one inbound event.
pub fn record_dispatch(outcome: &DispatchOutcome) {
    if let Some(error) = &outcome.error {
        counter!(names::ROUTING_ERRORS_TOTAL, "code" => error.code()).increment(1);
    }
    if outcome.published > 0 {
        counter!(names::BUS_PUBLISHED_TOTAL).increment(outcome.published as u64);
    }
    if outcome.publish_failures > 0 {
        counter!(names::BUS_ERRORS_TOTAL).increment(outcome.publish_failures as u64);
    }
}

/// Record an envelope received from the bus.
pub fn record_remote(outcome: RemoteDelivery) {
    counter!(names::BUS_RECEIVED_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

/// Update the number of identities held.
pub fn set_presence_online(count: usize) {
    gauge!(names::PRESENCE_ONLINE).set(count as f64);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
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
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callmirror_core::RoutingError;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op.
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_record_outcomes_without_recorder() {
        record_auth_failure(&AuthError::Expired);
        record_dispatch(&DispatchOutcome {
            delivered: 1,
            published: 1,
            publish_failures: 1,
            error: Some(RoutingError::SelfCall),
        });
        record_remote(RemoteDelivery::OwnOrigin);
        record_event("call:end", 42, "inbound");
    }
}
