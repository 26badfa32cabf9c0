//! Per-state-machine health tracking.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

/// No apply for this long while running marks the machine stale.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftHealthSnapshot {
    pub group_id: String,
    pub running: bool,
    pub leader_id: String,
    pub last_applied_index: i64,
    pub last_snapshot_index: i64,
    pub last_applied_at_ms: Option<u64>,
    pub last_snapshot_at_ms: Option<u64>,
    pub stale: bool,
    pub safe_mode: bool,
    pub safe_mode_reason: String,
}

#[derive(Debug, Default)]
struct Labels {
    leader_id: String,
    safe_mode_reason: String,
}

/// Lock-free counters read by health probes. Timestamps are epoch millis,
/// zero meaning "never".
#[derive(Debug)]
pub struct StateMachineMetrics {
    group_id: String,
    running: AtomicBool,
    last_applied_index: AtomicI64,
    last_snapshot_index: AtomicI64,
    snapshots_taken: AtomicU64,
    last_applied_at: AtomicU64,
    last_snapshot_at: AtomicU64,
    started_at: AtomicU64,
    safe_mode: AtomicBool,
    labels: RwLock<Labels>,
}

impl StateMachineMetrics {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            running: AtomicBool::new(false),
            last_applied_index: AtomicI64::new(-1),
            last_snapshot_index: AtomicI64::new(-1),
            snapshots_taken: AtomicU64::new(0),
            last_applied_at: AtomicU64::new(0),
            last_snapshot_at: AtomicU64::new(0),
            started_at: AtomicU64::new(0),
            safe_mode: AtomicBool::new(false),
            labels: RwLock::new(Labels::default()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn mark_started(&self, now_ms: u64) {
        self.running.store(true, Ordering::SeqCst);
        let _ = self
            .started_at
            .compare_exchange(0, now_ms, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn record_apply(&self, index: u64, now_ms: u64) {
        self.last_applied_index.store(index as i64, Ordering::SeqCst);
        self.last_applied_at.store(now_ms, Ordering::SeqCst);
    }

    pub fn record_snapshot(&self, index: i64, now_ms: u64) {
        self.last_snapshot_index.store(index, Ordering::SeqCst);
        self.last_snapshot_at.store(now_ms, Ordering::SeqCst);
        self.snapshots_taken.fetch_add(1, Ordering::SeqCst);
    }

    pub fn update_leader(&self, leader_id: &str) {
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .leader_id = leader_id.to_string();
    }

    pub fn set_safe_mode(&self, enabled: bool, reason: &str) {
        self.safe_mode.store(enabled, Ordering::SeqCst);
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .safe_mode_reason = reason.to_string();
    }

    pub fn last_applied_index(&self) -> i64 {
        self.last_applied_index.load(Ordering::SeqCst)
    }

    pub fn last_snapshot_index(&self) -> i64 {
        self.last_snapshot_index.load(Ordering::SeqCst)
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::SeqCst)
    }

    pub fn health(&self, now_ms: u64) -> RaftHealthSnapshot {
        self.health_with_staleness(now_ms, DEFAULT_STALENESS)
    }

    pub fn health_with_staleness(&self, now_ms: u64, staleness: Duration) -> RaftHealthSnapshot {
        let nonzero = |v: u64| (v != 0).then_some(v);
        let last_applied_at = nonzero(self.last_applied_at.load(Ordering::SeqCst));
        let threshold = staleness.as_millis() as u64;
        let stale = self.running()
            && threshold > 0
            && last_applied_at.is_some_and(|at| at.saturating_add(threshold) < now_ms);
        let labels = self.labels.read().unwrap_or_else(PoisonError::into_inner);

        RaftHealthSnapshot {
            group_id: self.group_id.clone(),
            running: self.running(),
            leader_id: labels.leader_id.clone(),
            last_applied_index: self.last_applied_index(),
            last_snapshot_index: self.last_snapshot_index(),
            last_applied_at_ms: last_applied_at,
            last_snapshot_at_ms: nonzero(self.last_snapshot_at.load(Ordering::SeqCst)),
            stale,
            safe_mode: self.safe_mode.load(Ordering::SeqCst),
            safe_mode_reason: labels.safe_mode_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_health() {
        let metrics = StateMachineMetrics::new("g1");
        let health = metrics.health(1_000);
        assert_eq!(health.group_id, "g1");
        assert!(!health.running);
        assert_eq!(health.last_applied_index, -1);
        assert_eq!(health.last_snapshot_index, -1);
        assert!(health.last_applied_at_ms.is_none());
        assert!(!health.stale);
    }

    #[test]
    fn test_staleness_requires_running_and_old_apply() {
        let metrics = StateMachineMetrics::new("g1");
        metrics.record_apply(7, 1_000);
        assert!(!metrics.health(100_000).stale);

        metrics.mark_started(1_000);
        assert!(!metrics.health(31_000).stale);
        assert!(metrics.health(31_001).stale);
        assert!(!metrics.health_with_staleness(31_001, Duration::ZERO).stale);
    }

    #[test]
    fn test_snapshot_and_labels() {
        let metrics = StateMachineMetrics::new("g1");
        metrics.record_snapshot(12, 50);
        metrics.update_leader("node-2");
        metrics.set_safe_mode(true, "rebalance");

        let health = metrics.health(60);
        assert_eq!(health.last_snapshot_index, 12);
        assert_eq!(health.last_snapshot_at_ms, Some(50));
        assert_eq!(health.leader_id, "node-2");
        assert!(health.safe_mode);
        assert_eq!(health.safe_mode_reason, "rebalance");
        assert_eq!(metrics.snapshots_taken(), 1);
    }
}
