//! Prometheus metrics for collab-server.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const WS_CONNECTIONS_ACTIVE: &str = "collab_ws_connections_active";
const WS_MESSAGES_TOTAL: &str = "collab_ws_messages_total";
const SESSIONS_ACTIVE: &str = "collab_sessions_active";
const OPERATIONS_TOTAL: &str = "collab_operations_total";
const HISTORY_STEPS_TOTAL: &str = "collab_history_steps_total";
const SLOW_CLIENTS_DROPPED_TOTAL: &str = "collab_slow_clients_dropped_total";
const VALIDATION_FAILURES_TOTAL: &str = "collab_validation_failures_total";
const RATE_LIMITED_TOTAL: &str = "collab_rate_limited_total";
const HANDLER_PANICS_TOTAL: &str = "collab_handler_panics_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Increment active WebSocket connections.
pub fn inc_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement active WebSocket connections.
pub fn dec_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a WebSocket message.
///
/// # Arguments
///
/// * `direction` - "inbound" or "outbound"
/// * `msg_type` - Message type (e.g., "diagram_operation_request")
pub fn record_ws_message(direction: &str, msg_type: &str) {
    counter!(
        WS_MESSAGES_TOTAL,
        "direction" => direction.to_string(),
        "type" => msg_type.to_string()
    )
    .increment(1);
}

/// Update the number of live collaboration sessions.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_sessions(count: usize) {
    gauge!(SESSIONS_ACTIVE).set(count as f64);
}

/// Record the outcome of a diagram operation.
///
/// # Arguments
///
/// * `outcome` - "accepted", "rejected" or "unauthorized"
/// * `reason` - Rejection reason, empty when accepted
pub fn record_operation(outcome: &str, reason: &str) {
    counter!(
        OPERATIONS_TOTAL,
        "outcome" => outcome.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an undo or redo.
pub fn record_history_step(direction: &str, applied: bool) {
    counter!(
        HISTORY_STEPS_TOTAL,
        "direction" => direction.to_string(),
        "applied" => applied.to_string()
    )
    .increment(1);
}

/// Record a client dropped because its outbound buffer was full.
pub fn record_slow_client_dropped() {
    counter!(SLOW_CLIENTS_DROPPED_TOTAL).increment(1);
}

/// Record an input validation failure.
///
/// # Arguments
///
/// * `validation_type` - Type of validation that failed (diagram_id, message_size, selection, etc.)
pub fn record_validation_failure(validation_type: &str) {
    counter!(
        VALIDATION_FAILURES_TOTAL,
        "type" => validation_type.to_string()
    )
    .increment(1);
}

/// Record a rate-limited request.
pub fn record_rate_limited(source: &str) {
    counter!(
        RATE_LIMITED_TOTAL,
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a panic recovered at the dispatch boundary.
pub fn record_handler_panic(msg_type: &str) {
    counter!(
        HANDLER_PANICS_TOTAL,
        "type" => msg_type.to_string()
    )
    .increment(1);
}
