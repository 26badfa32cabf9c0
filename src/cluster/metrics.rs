//! Prometheus metrics for the coordination kernel.
//!
//! Metrics cover:
//! - Membership transitions (join, heartbeat, suspect, down, leave)
//! - Leader acquisition attempts and lock operations
//! - Topology events emitted by the assignment services
//! - Replicated state machine progress (applied/snapshot index, snapshots, apply latency)
//! - Safe mode
//!
//! All metrics are registered to a custom registry with the "clusterkernel"
//! prefix. Registration errors fall back to an unregistered metric instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for kernel metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("clusterkernel".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Membership
// =============================================================================

define_counter_vec!(
    MEMBERSHIP_EVENTS,
    "membership_events_total",
    "Membership events emitted, by event type",
    ["type"]
);

// =============================================================================
// Leader election / locks
// =============================================================================

define_counter_vec!(
    LEADER_ACQUISITIONS,
    "leader_acquisitions_total",
    "Leader acquisition attempts, by mode and result",
    ["mode", "result"]
);
define_counter_vec!(
    LOCK_OPERATIONS,
    "lock_operations_total",
    "Distributed lock operations, by operation and result",
    ["op", "result"]
);

// =============================================================================
// Assignment
// =============================================================================

define_counter_vec!(
    TOPOLOGY_EVENTS,
    "topology_events_total",
    "Topology events emitted, by event type",
    ["type"]
);

// =============================================================================
// Replicated state machine
// =============================================================================

define_gauge_vec!(
    RAFT_LAST_APPLIED_INDEX,
    "raft_last_applied_index",
    "Last log index applied to the state machine",
    ["group"]
);
define_gauge_vec!(
    RAFT_LAST_SNAPSHOT_INDEX,
    "raft_last_snapshot_index",
    "Log index covered by the latest persisted snapshot",
    ["group"]
);
define_counter_vec!(
    RAFT_SNAPSHOTS,
    "raft_snapshots_total",
    "Snapshot attempts, by group and status",
    ["group", "status"]
);
define_counter_vec!(
    RAFT_APPLY_ERRORS,
    "raft_apply_errors_total",
    "Log entries that failed to apply, by error kind",
    ["kind"]
);
define_histogram_vec!(
    RAFT_APPLY_DURATION,
    "raft_apply_duration_seconds",
    "Time to apply one command to the state machine",
    ["type"],
    [0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05]
);
define_gauge_vec!(
    SAFE_MODE_ACTIVE,
    "safe_mode_active",
    "Whether rebalance safe mode is engaged (1) or not (0)",
    ["group"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts, by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Registration helpers
// =============================================================================

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_membership_event(event_type: &str) {
    MEMBERSHIP_EVENTS.with_label_values(&[event_type]).inc();
}

pub fn record_leader_acquisition(mode: &str, acquired: bool) {
    let result = if acquired { "acquired" } else { "contended" };
    LEADER_ACQUISITIONS.with_label_values(&[mode, result]).inc();
}

pub fn record_lock_operation(op: &str, success: bool) {
    let result = if success { "ok" } else { "rejected" };
    LOCK_OPERATIONS.with_label_values(&[op, result]).inc();
}

pub fn record_topology_event(event_type: &str) {
    TOPOLOGY_EVENTS.with_label_values(&[event_type]).inc();
}

pub fn record_apply(command_type: &str, duration_secs: f64) {
    RAFT_APPLY_DURATION
        .with_label_values(&[command_type])
        .observe(duration_secs);
}

pub fn record_apply_error(kind: &str) {
    RAFT_APPLY_ERRORS.with_label_values(&[kind]).inc();
}

pub fn set_last_applied_index(group: &str, index: u64) {
    RAFT_LAST_APPLIED_INDEX
        .with_label_values(&[group])
        .set(index as i64);
}

pub fn record_snapshot(group: &str, index: u64, success: bool) {
    let status = if success { "success" } else { "failure" };
    RAFT_SNAPSHOTS.with_label_values(&[group, status]).inc();
    if success {
        RAFT_LAST_SNAPSHOT_INDEX
            .with_label_values(&[group])
            .set(index as i64);
    }
}

pub fn set_safe_mode(group: &str, active: bool) {
    SAFE_MODE_ACTIVE
        .with_label_values(&[group])
        .set(i64::from(active));
}
