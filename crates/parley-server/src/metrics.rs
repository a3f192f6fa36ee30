//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names recorded by the broker crates and this host.

/// Identified sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Sessions admitted (counter, labels: role).
pub const SESSIONS_CONNECTED_TOTAL: &str = "sessions_connected_total";
/// Sessions removed (counter, labels: reason).
pub const SESSIONS_DISCONNECTED_TOTAL: &str = "sessions_disconnected_total";
/// Identify attempts refused (counter).
pub const SESSIONS_REJECTED_TOTAL: &str = "sessions_rejected_total";
/// Inbound envelopes (counter, labels: type).
pub const ENVELOPES_RECEIVED_TOTAL: &str = "envelopes_received_total";
/// Errors reported to peers (counter, labels: kind).
pub const BROKER_ERRORS_TOTAL: &str = "broker_errors_total";
/// Pending interactions (gauge).
pub const INTERACTIONS_ACTIVE: &str = "interactions_active";
/// Interactions created (counter).
pub const INTERACTIONS_CREATED_TOTAL: &str = "interactions_created_total";
/// Interactions refused at the admission limit (counter).
pub const INTERACTIONS_REJECTED_TOTAL: &str = "interactions_rejected_total";
/// Interactions settled (counter, labels: status).
pub const INTERACTIONS_SETTLED_TOTAL: &str = "interactions_settled_total";
/// Interactions that expired (counter).
pub const INTERACTIONS_TIMED_OUT_TOTAL: &str = "interactions_timed_out_total";
/// Routed messages (counter, labels: kind).
pub const ROUTES_TOTAL: &str = "routes_total";
/// Inbound route responses (counter, labels: outcome).
pub const ROUTE_RESPONSES_TOTAL: &str = "route_responses_total";
/// Routed requests that expired (counter).
pub const ROUTE_TIMEOUTS_TOTAL: &str = "route_timeouts_total";
/// Messages waiting for offline targets (gauge).
pub const ROUTE_QUEUE_DEPTH: &str = "route_queue_depth";
/// Queued messages evicted at capacity (counter).
pub const ROUTE_QUEUE_DROPPED_TOTAL: &str = "route_queue_dropped_total";
/// Tool operations invoked (counter, labels: operation).
pub const TOOL_CALLS_TOTAL: &str = "tool_calls_total";
/// Tool operations failed (counter, labels: operation).
pub const TOOL_ERRORS_TOTAL: &str = "tool_errors_total";
/// Tool operation duration seconds (histogram, labels: operation).
pub const TOOL_CALL_DURATION_SECONDS: &str = "tool_call_duration_seconds";
/// Retries performed by the resilience engine (counter, labels: mode).
pub const RESILIENCE_RETRIES_TOTAL: &str = "resilience_retries_total";
/// Errors recorded by the health monitor (counter, labels: kind).
pub const HEALTH_ERRORS_RECORDED_TOTAL: &str = "health_errors_recorded_total";
/// Sampled resident memory (gauge).
pub const PROCESS_MEMORY_BYTES: &str = "process_memory_bytes";
/// Bridge reconnect attempts (counter).
pub const BRIDGE_RECONNECTS_TOTAL: &str = "bridge_reconnects_total";
/// `WebSocket` connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// `WebSocket` connections closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open `WebSocket` connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// `WebSocket` connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
