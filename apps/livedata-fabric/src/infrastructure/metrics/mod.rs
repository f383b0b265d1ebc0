//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: ticks received and dropped per provider
//! - **Subscriptions**: subscription outcomes per provider
//! - **Snapshots**: captures, releases and retained count
//! - **Heartbeats**: leases refreshed and expired
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
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
    describe_counter!(
        "livedata_ticks_received_total",
        "Ticks received from upstream feeds"
    );
    describe_counter!(
        "livedata_ticks_dropped_total",
        "Ticks dropped because their specification was not subscribed"
    );
    describe_counter!(
        "livedata_subscription_results_total",
        "Subscription results delivered, by outcome"
    );
    describe_counter!("livedata_snapshots_taken_total", "Snapshots captured");
    describe_counter!("livedata_snapshots_released_total", "Snapshots released");
    describe_gauge!(
        "livedata_snapshots_retained",
        "Snapshots currently retained"
    );
    describe_gauge!(
        "livedata_active_specifications",
        "Specifications currently subscribed upstream"
    );
    describe_counter!(
        "livedata_heartbeats_received_total",
        "Heartbeat messages received"
    );
    describe_counter!(
        "livedata_leases_expired_total",
        "Specification leases that expired without a heartbeat"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Subscription outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Subscription succeeded.
    Succeeded,
    /// Subscription failed.
    Failed,
}

impl SubscriptionOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Record a tick received by a provider.
pub fn record_tick_received(provider: &str) {
    counter!("livedata_ticks_received_total", "provider" => provider.to_string()).increment(1);
}

/// Record a tick dropped by a provider.
pub fn record_tick_dropped(provider: &str) {
    counter!("livedata_ticks_dropped_total", "provider" => provider.to_string()).increment(1);
}

/// Record a delivered subscription result.
pub fn record_subscription_result(provider: &str, outcome: SubscriptionOutcome) {
    counter!(
        "livedata_subscription_results_total",
        "provider" => provider.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a captured snapshot and the resulting retained count.
pub fn record_snapshot_taken(provider: &str, retained: usize) {
    counter!("livedata_snapshots_taken_total", "provider" => provider.to_string()).increment(1);
    set_snapshots_retained(provider, retained);
}

/// Record a released snapshot and the resulting retained count.
pub fn record_snapshot_released(provider: &str, retained: usize) {
    counter!("livedata_snapshots_released_total", "provider" => provider.to_string())
        .increment(1);
    set_snapshots_retained(provider, retained);
}

#[allow(clippy::cast_precision_loss)]
fn set_snapshots_retained(provider: &str, retained: usize) {
    gauge!("livedata_snapshots_retained", "provider" => provider.to_string()).set(retained as f64);
}

/// Update the number of upstream specifications for a provider.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_specifications(provider: &str, count: usize) {
    gauge!("livedata_active_specifications", "provider" => provider.to_string())
        .set(count as f64);
}

/// Record a heartbeat message received.
pub fn record_heartbeat_received() {
    counter!("livedata_heartbeats_received_total").increment(1);
}

/// Record an expired specification lease.
pub fn record_lease_expired() {
    counter!("livedata_leases_expired_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
