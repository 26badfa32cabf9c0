//! Replicated state machine for one coordination group.
//!
//! Leader and followers converge on the same deterministic apply path:
//! entries arrive strictly in index order, each command is applied using
//! only the data it carries, and positions at or below the last applied
//! one are skipped so a replay after restart never double-increments a
//! version.
//!
//! ```text
//!   log entry ──► check position ──► decode ──► domain apply ──► topology event
//!                    │ ≤ last: skip                                   │
//!                    │ gap: LogGap                                    ▼
//!                    ▼                                          maybe snapshot
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::commands::{self, CommandResponse, RaftCommand, RaftCommandEnvelope};
use super::config::RaftServerConfig;
use super::domains::{AssignmentDomainState, DomainOutcome, LockDomainState};
use super::health::{RaftHealthSnapshot, StateMachineMetrics};
use super::processing_guard::LeaderProcessingGuard;
use super::safe_mode::RebalanceSafeModeGuard;
use super::snapshot::{ClusterSnapshot, SNAPSHOT_FORMAT_VERSION, SnapshotStore};
use crate::cluster::assignment::{Assignment, KeyAssignment, KeyAssignmentMap, TopologyEvent};
use crate::cluster::clock::{Clock, SystemClock};
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::leader::LeaderElectionService;
use crate::cluster::lock::LockRecord;
use crate::cluster::metrics;

const TOPOLOGY_CHANNEL_CAPACITY: usize = 1024;

/// `(term, index)` of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: u64,
    pub index: u64,
}

impl LogPosition {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

#[derive(Debug)]
struct ReplicatedState {
    last_applied: Option<LogPosition>,
    locks: LockDomainState,
    assignments: AssignmentDomainState,
    membership: Option<Value>,
    /// Consensus log id of `last_applied`, opaque to the state machine.
    log_id: Option<Value>,
    /// Log id of the entry about to be applied, adopted once admitted.
    staged_log_id: Option<(u64, Value)>,
    /// Newest command timestamp applied. Snapshots drop locks expired at
    /// this time so every replica writes the same snapshot for an index.
    applied_at_ms: u64,
}

pub struct ClusterStateMachine {
    group_id: String,
    state: RwLock<ReplicatedState>,
    snapshot_store: Arc<dyn SnapshotStore>,
    snapshot_threshold: u64,
    applied_since_snapshot: AtomicU64,
    clock: Arc<dyn Clock>,
    metrics: Arc<StateMachineMetrics>,
    safe_mode: Arc<RebalanceSafeModeGuard>,
    topology: broadcast::Sender<TopologyEvent>,
}

impl ClusterStateMachine {
    /// State machine for `group_id`. A `snapshot_threshold` of zero turns
    /// off automatic snapshots.
    pub fn new(
        group_id: impl Into<String>,
        snapshot_store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        snapshot_threshold: u64,
    ) -> Self {
        let group_id = group_id.into();
        let (topology, _) = broadcast::channel(TOPOLOGY_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ReplicatedState {
                last_applied: None,
                locks: LockDomainState::new(),
                assignments: AssignmentDomainState::new(group_id.clone()),
                membership: None,
                log_id: None,
                staged_log_id: None,
                applied_at_ms: 0,
            }),
            snapshot_store,
            snapshot_threshold,
            applied_since_snapshot: AtomicU64::new(0),
            metrics: Arc::new(StateMachineMetrics::new(group_id.clone())),
            safe_mode: Arc::new(RebalanceSafeModeGuard::with_clock(
                group_id.clone(),
                clock.clone(),
            )),
            clock,
            topology,
            group_id,
        }
    }

    pub fn for_config(
        group_id: impl Into<String>,
        config: &RaftServerConfig,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self::new(
            group_id,
            snapshot_store,
            Arc::new(SystemClock),
            config.snapshot_threshold,
        )
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn metrics(&self) -> Arc<StateMachineMetrics> {
        self.metrics.clone()
    }

    pub fn safe_mode_guard(&self) -> Arc<RebalanceSafeModeGuard> {
        self.safe_mode.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn health(&self) -> RaftHealthSnapshot {
        self.metrics.health(self.clock.now_ms())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mark running and restore the latest persisted snapshot, if any.
    pub async fn start(&self) -> CoordinationResult<bool> {
        self.metrics.mark_started(self.clock.now_ms());
        self.metrics
            .set_safe_mode(self.safe_mode.is_safe_mode(), &self.safe_mode.reason());
        let restored = self.load_snapshot().await?;
        info!(group_id = %self.group_id, restored, "Started cluster state machine");
        Ok(restored)
    }

    pub fn stop(&self) {
        self.metrics.mark_stopped();
        info!(group_id = %self.group_id, "Stopped cluster state machine");
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Decode and apply the command stored at `position`.
    ///
    /// A payload that cannot be decoded consumes its position and returns
    /// the decode error. The entry is never reinterpreted.
    pub async fn apply(
        &self,
        position: LogPosition,
        bytes: &[u8],
    ) -> CoordinationResult<CommandResponse> {
        let result = {
            let mut state = self.state.write().await;
            if let Some(skipped) = self.admit(&mut state, position)? {
                return Ok(skipped);
            }
            match commands::decode(bytes) {
                Ok(envelope) => self.apply_admitted(&mut state, position, &envelope),
                Err(e) => {
                    self.applied_since_snapshot.fetch_add(1, Ordering::SeqCst);
                    metrics::record_apply_error(e.as_metric_label());
                    error!(group_id = %self.group_id, index = position.index, error = %e, "Undecodable log entry");
                    Err(e)
                }
            }
        };
        self.maybe_snapshot().await;
        result
    }

    /// Apply an already decoded command stored at `position`.
    pub async fn apply_envelope(
        &self,
        position: LogPosition,
        envelope: &RaftCommandEnvelope,
    ) -> CoordinationResult<CommandResponse> {
        let result = {
            let mut state = self.state.write().await;
            if let Some(skipped) = self.admit(&mut state, position)? {
                return Ok(skipped);
            }
            self.apply_admitted(&mut state, position, envelope)
        };
        self.maybe_snapshot().await;
        result
    }

    /// Advance past a blank entry.
    pub async fn record_applied(&self, position: LogPosition) -> CoordinationResult<CommandResponse> {
        let mut state = self.state.write().await;
        Ok(self
            .admit(&mut state, position)?
            .unwrap_or(CommandResponse::Ok))
    }

    /// Advance past a membership entry, remembering `membership` for
    /// snapshots.
    pub async fn record_membership(
        &self,
        position: LogPosition,
        membership: Value,
    ) -> CoordinationResult<CommandResponse> {
        let mut state = self.state.write().await;
        if let Some(skipped) = self.admit(&mut state, position)? {
            return Ok(skipped);
        }
        state.membership = Some(membership);
        Ok(CommandResponse::Ok)
    }

    /// Consensus log id of the entry at `index`. It becomes the machine's
    /// log id when that entry is admitted, and travels with snapshots so
    /// the log can resume after a restart.
    pub async fn stage_log_id(&self, index: u64, log_id: Value) {
        self.state.write().await.staged_log_id = Some((index, log_id));
    }

    /// Set the log id of the current position, after installing a snapshot.
    pub async fn record_log_id(&self, log_id: Value) {
        self.state.write().await.log_id = Some(log_id);
    }

    pub async fn log_id(&self) -> Option<Value> {
        self.state.read().await.log_id.clone()
    }

    /// Move `last_applied` to `position`, or report why not.
    ///
    /// `Ok(Some(Skipped))` for a position already applied. A position at
    /// or below the applied index with a newer term is a `LogConflict`.
    /// The first entry after a clean start may have any index.
    fn admit(
        &self,
        state: &mut ReplicatedState,
        position: LogPosition,
    ) -> CoordinationResult<Option<CommandResponse>> {
        if let Some(last) = state.last_applied {
            if position.index <= last.index && position.term > last.term {
                let err = CoordinationError::LogConflict {
                    term: position.term,
                    index: position.index,
                    applied_term: last.term,
                    applied_index: last.index,
                };
                metrics::record_apply_error(err.as_metric_label());
                error!(group_id = %self.group_id, error = %err, "Log rewritten below applied state");
                return Err(err);
            }
            if position.index <= last.index {
                debug!(group_id = %self.group_id, index = position.index, last_applied = last.index, "Skipping applied entry");
                return Ok(Some(CommandResponse::Skipped {
                    index: position.index,
                }));
            }
            if position.index > last.index + 1 {
                let err = CoordinationError::LogGap {
                    expected: last.index + 1,
                    found: position.index,
                };
                metrics::record_apply_error(err.as_metric_label());
                error!(group_id = %self.group_id, error = %err, "Refusing to apply out of order");
                return Err(err);
            }
        }

        state.last_applied = Some(position);
        if let Some((index, log_id)) = state.staged_log_id.take() {
            if index == position.index {
                state.log_id = Some(log_id);
            }
        }
        self.metrics.record_apply(position.index, self.clock.now_ms());
        metrics::set_last_applied_index(&self.group_id, position.index);
        Ok(None)
    }

    fn apply_admitted(
        &self,
        state: &mut ReplicatedState,
        position: LogPosition,
        envelope: &RaftCommandEnvelope,
    ) -> CoordinationResult<CommandResponse> {
        let started = Instant::now();
        let command_type = envelope.command_type();
        state.applied_at_ms = state.applied_at_ms.max(envelope.command().timestamp_ms());

        let outcome: CoordinationResult<DomainOutcome> = match envelope.command() {
            RaftCommand::Lock(cmd) => Ok((state.locks.acquire(cmd), None)),
            RaftCommand::ReleaseLock(cmd) => Ok((state.locks.release(cmd), None)),
            RaftCommand::AssignPartition(cmd) => state.assignments.assign_partition(cmd),
            RaftCommand::RevokePartition(cmd) => state.assignments.revoke_partition(cmd),
            RaftCommand::AssignKey(cmd) => state.assignments.assign_key(cmd),
            RaftCommand::UnassignKey(cmd) => state.assignments.unassign_key(cmd),
        };
        self.applied_since_snapshot.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok((response, event)) => {
                metrics::record_apply(command_type.as_str(), started.elapsed().as_secs_f64());
                debug!(group_id = %self.group_id, index = position.index, command = %command_type, "Applied command");
                if let Some(event) = event {
                    metrics::record_topology_event(event.event_type.as_str());
                    let _ = self.topology.send(event);
                }
                Ok(response)
            }
            Err(e) => {
                metrics::record_apply_error(e.as_metric_label());
                warn!(group_id = %self.group_id, index = position.index, command = %command_type, error = %e, "Command rejected by state machine");
                Err(e)
            }
        }
    }

    async fn maybe_snapshot(&self) {
        if self.snapshot_threshold == 0
            || self.applied_since_snapshot.load(Ordering::SeqCst) < self.snapshot_threshold
        {
            return;
        }
        if let Err(e) = self.take_snapshot().await {
            warn!(group_id = %self.group_id, error = %e, "Automatic snapshot failed");
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Current state as a snapshot, without persisting it.
    pub async fn build_snapshot(&self) -> ClusterSnapshot {
        let now = self.clock.now_ms();
        let state = self.state.read().await;
        let (term, index) = state
            .last_applied
            .map_or((-1, -1), |p| (p.term as i64, p.index as i64));
        ClusterSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            group_id: self.group_id.clone(),
            term,
            index,
            taken_at_ms: now,
            applied_at_ms: state.applied_at_ms,
            locks: state.locks.snapshot(state.applied_at_ms),
            assignments: state.assignments.table().assignments().clone(),
            key_assignments: state.assignments.table().key_assignments().clone(),
            membership: state.membership.clone(),
            log_id: state.log_id.clone(),
        }
    }

    /// Capture and persist the state as of the last applied entry.
    ///
    /// Counters and the last snapshot index only move once the snapshot
    /// store accepted the write.
    pub async fn take_snapshot(&self) -> CoordinationResult<ClusterSnapshot> {
        let snapshot = self.build_snapshot().await;
        if let Err(e) = self.snapshot_store.persist(&snapshot).await {
            metrics::record_snapshot(&self.group_id, 0, false);
            error!(group_id = %self.group_id, index = snapshot.index, error = %e, "Failed to persist snapshot");
            return Err(e);
        }

        self.applied_since_snapshot.store(0, Ordering::SeqCst);
        self.metrics
            .record_snapshot(snapshot.index, snapshot.taken_at_ms);
        metrics::record_snapshot(&self.group_id, snapshot.index.max(0) as u64, true);
        info!(
            group_id = %self.group_id,
            term = snapshot.term,
            index = snapshot.index,
            locks = snapshot.locks.len(),
            assignments = snapshot.assignments.len(),
            backend = self.snapshot_store.kind(),
            "Took snapshot"
        );
        Ok(snapshot)
    }

    /// Restore the latest persisted snapshot. `Ok(false)` when there is none
    /// or its format version is not understood.
    pub async fn load_snapshot(&self) -> CoordinationResult<bool> {
        let Some(snapshot) = self.snapshot_store.load_latest(&self.group_id).await? else {
            debug!(group_id = %self.group_id, "No snapshot to restore");
            return Ok(false);
        };
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            warn!(
                group_id = %self.group_id,
                expected = SNAPSHOT_FORMAT_VERSION,
                found = snapshot.format_version,
                "Ignoring snapshot with unknown format version"
            );
            return Ok(false);
        }
        self.restore(snapshot).await?;
        Ok(true)
    }

    /// Replace all state with `snapshot` and rewind to its position.
    pub async fn restore(&self, snapshot: ClusterSnapshot) -> CoordinationResult<()> {
        if snapshot.group_id != self.group_id {
            return Err(CoordinationError::GroupMismatch {
                machine_group: self.group_id.clone(),
                command_group: snapshot.group_id,
            });
        }

        let position = snapshot.position().map(|(term, index)| LogPosition::new(term, index));
        {
            let mut state = self.state.write().await;
            state.locks.restore(snapshot.locks);
            state
                .assignments
                .table_mut()
                .replace(snapshot.assignments, snapshot.key_assignments);
            state.membership = snapshot.membership;
            state.log_id = snapshot.log_id;
            state.staged_log_id = None;
            state.applied_at_ms = snapshot.applied_at_ms;
            if position.is_some() {
                state.last_applied = position;
            }
        }

        self.applied_since_snapshot.store(0, Ordering::SeqCst);
        if let Some(position) = position {
            self.metrics.record_apply(position.index, snapshot.taken_at_ms);
            metrics::set_last_applied_index(&self.group_id, position.index);
        }
        self.metrics.record_snapshot(snapshot.index, snapshot.taken_at_ms);
        self.metrics
            .set_safe_mode(self.safe_mode.is_safe_mode(), &self.safe_mode.reason());
        info!(
            group_id = %self.group_id,
            term = snapshot.term,
            index = snapshot.index,
            taken_at_ms = snapshot.taken_at_ms,
            "Restored snapshot"
        );
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn last_applied(&self) -> Option<LogPosition> {
        self.state.read().await.last_applied
    }

    pub async fn membership(&self) -> Option<Value> {
        self.state.read().await.membership.clone()
    }

    /// Unexpired lock `name` by the local clock.
    pub async fn get_lock(&self, name: &str) -> Option<LockRecord> {
        let now = self.clock.now_ms();
        self.state.read().await.locks.get(name, now).cloned()
    }

    pub async fn locks(&self) -> BTreeMap<String, LockRecord> {
        let now = self.clock.now_ms();
        self.state.read().await.locks.snapshot(now)
    }

    pub async fn find_assignment(&self, partition: i32) -> Option<Assignment> {
        self.state
            .read()
            .await
            .assignments
            .table()
            .assignment(partition)
            .cloned()
    }

    pub async fn key_assignment(&self, partition: i32, kind: &str, key: &str) -> Option<KeyAssignment> {
        self.state
            .read()
            .await
            .assignments
            .table()
            .key_assignment(partition, kind, key)
            .cloned()
    }

    pub async fn assignments(&self) -> BTreeMap<i32, Assignment> {
        self.state.read().await.assignments.table().assignments().clone()
    }

    pub async fn key_assignments(&self) -> KeyAssignmentMap {
        self.state
            .read()
            .await
            .assignments
            .table()
            .key_assignments()
            .clone()
    }

    pub fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }

    // ========================================================================
    // Guards
    // ========================================================================

    pub fn enter_safe_mode(&self, reason: &str) {
        self.safe_mode.enter(reason);
        self.metrics.set_safe_mode(true, reason);
    }

    pub fn exit_safe_mode(&self) {
        self.safe_mode.exit();
        self.metrics.set_safe_mode(false, "");
    }

    /// Processing gate for `node_id` sharing this machine's safe-mode guard.
    pub fn leader_processing_guard(
        &self,
        leader_election: Arc<dyn LeaderElectionService>,
        node_id: impl Into<String>,
    ) -> LeaderProcessingGuard {
        LeaderProcessingGuard::new(
            leader_election,
            self.group_id.clone(),
            node_id,
            self.safe_mode.clone(),
            self.metrics.clone(),
        )
    }
}
