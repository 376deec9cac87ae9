//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections refused before or at upgrade (counter, labels: reason).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Valid inbound messages (counter, labels: type).
pub const MESSAGES_RECEIVED_TOTAL: &str = "messages_received_total";
/// Inbound messages rejected (counter, labels: code).
pub const MESSAGES_REJECTED_TOTAL: &str = "messages_rejected_total";
/// Inbound duplicates dropped (counter).
pub const MESSAGES_DUPLICATE_TOTAL: &str = "messages_duplicate_total";
/// Rate-limit rejections (counter, labels: scope).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Failed handshakes (counter).
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
/// Connections evicted by the heartbeat monitor (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "heartbeat_evictions_total";
/// Connections dropped because their outbound queue was full (counter).
pub const SLOW_CONSUMER_DISCONNECTS_TOTAL: &str = "slow_consumer_disconnects_total";
/// Streams opened (counter, labels: direction).
pub const STREAMS_STARTED_TOTAL: &str = "streams_started_total";
/// Streams ended (counter, labels: direction, reason).
pub const STREAMS_ENDED_TOTAL: &str = "streams_ended_total";
/// Queries handed to the reasoning service (counter).
pub const QUERIES_TOTAL: &str = "queries_total";
/// Reasoning latency until the first reply frame, in seconds (histogram).
pub const QUERY_DURATION_SECONDS: &str = "query_duration_seconds";
