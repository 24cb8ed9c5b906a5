//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames received and frames that failed to parse
//! - **Prices**: Feed updates by guard outcome, manual overrides, auto-resets
//! - **Connection**: Connection state gauge and reconnection attempts
//! - **Cache**: Cached instrument count, resets
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::connection::ConnectionState;
use crate::domain::pricing::UpdateOutcome;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "market_sync_frames_received_total",
        "Total text frames received from the feed"
    );
    describe_counter!(
        "market_sync_parse_errors_total",
        "Total inbound frames dropped as malformed"
    );

    // Price counters
    describe_counter!(
        "market_sync_price_updates_total",
        "Feed price updates by guard outcome"
    );
    describe_counter!(
        "market_sync_manual_overrides_total",
        "Prices set through the manual override path"
    );
    describe_counter!(
        "market_sync_auto_resets_total",
        "Prices restored to reference by the detection sweep"
    );
    describe_counter!(
        "market_sync_force_resets_total",
        "Forced cache resets by result"
    );

    // Connection
    describe_gauge!(
        "market_sync_connection_state",
        "Current connection state (1 for the active state label)"
    );
    describe_counter!(
        "market_sync_reconnects_total",
        "Total reconnection attempts scheduled"
    );
    describe_counter!(
        "market_sync_reconnect_exhausted_total",
        "Times reconnection gave up after the attempt cap"
    );

    // Cache
    describe_gauge!(
        "market_sync_cached_instruments",
        "Number of instruments in the price cache"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const STATES: [ConnectionState; 5] = [
    ConnectionState::Disconnected,
    ConnectionState::Connecting,
    ConnectionState::Connected,
    ConnectionState::Closing,
    ConnectionState::Reconnecting,
];

const fn outcome_label(outcome: &UpdateOutcome) -> &'static str {
    match outcome {
        UpdateOutcome::Stored { .. } => "stored",
        UpdateOutcome::Clamped { .. } => "clamped",
        UpdateOutcome::Discarded(reason) => reason.as_str(),
    }
}

/// Record a text frame received from the feed.
pub fn record_frame_received() {
    counter!("market_sync_frames_received_total").increment(1);
}

/// Record an inbound frame dropped as malformed.
pub fn record_parse_error() {
    counter!("market_sync_parse_errors_total").increment(1);
}

/// Record the guard outcome of a feed price update.
pub fn record_price_update(outcome: &UpdateOutcome) {
    counter!(
        "market_sync_price_updates_total",
        "outcome" => outcome_label(outcome)
    )
    .increment(1);
}

/// Record a manual price override.
pub fn record_manual_override() {
    counter!("market_sync_manual_overrides_total").increment(1);
}

/// Record prices restored by the detection sweep.
pub fn record_auto_resets(count: usize) {
    counter!("market_sync_auto_resets_total").increment(count as u64);
}

/// Record a forced reset by result (`reconnected`, `pending` or `failed`).
pub fn record_force_reset(result: &'static str) {
    counter!("market_sync_force_resets_total", "result" => result).increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    for candidate in STATES {
        gauge!(
            "market_sync_connection_state",
            "state" => candidate.as_str()
        )
        .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("market_sync_reconnects_total").increment(1);
}

/// Record reconnection giving up.
pub fn record_reconnect_exhausted() {
    counter!("market_sync_reconnect_exhausted_total").increment(1);
}

/// Update the cached instrument gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_instruments(count: usize) {
    gauge!("market_sync_cached_instruments").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
