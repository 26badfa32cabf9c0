//! Raft storage implementation using openraft's RaftStorage trait (v1 API).
//!
//! Log and vote are kept in memory. Applied state lives in a shared
//! [`ClusterStateMachine`]; snapshots are its JSON [`ClusterSnapshot`] and
//! are persisted through the state machine's snapshot store.
//!
//! [`RaftStore::open`] resumes from a state machine that restored a
//! snapshot: the snapshot's log id becomes the applied and purged log id
//! and the last vote, so new entries are numbered after it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::commands::CommandResponse;
use super::snapshot::ClusterSnapshot;
use super::state_machine::{ClusterStateMachine, LogPosition};
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::error::{CoordinationError, CoordinationResult};

/// Snapshot served to followers and on `get_current_snapshot`.
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

/// Combined log and state machine storage for one replicated group.
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    sm: Arc<ClusterStateMachine>,
    /// Held for writing across a whole apply batch so snapshots see a
    /// log id that matches the state they capture.
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
}

fn log_position(log_id: &LogId<RaftNodeId>) -> LogPosition {
    LogPosition::new(log_id.leader_id.term, log_id.index)
}

fn storage_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    err: impl ToString,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(err.to_string()))
}

impl RaftStore {
    pub fn new(sm: Arc<ClusterStateMachine>) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Store for `sm`, resuming at the log id of the snapshot it restored.
    pub async fn open(sm: Arc<ClusterStateMachine>) -> CoordinationResult<Self> {
        let store = Self::new(sm);
        let Some(value) = store.sm.log_id().await else {
            return Ok(store);
        };
        let log_id: LogId<RaftNodeId> = serde_json::from_value(value)?;
        let membership: StoredMembership<RaftNodeId, BasicNode> = match store.sm.membership().await {
            Some(value) => serde_json::from_value(value)?,
            None => StoredMembership::default(),
        };
        let data = store.sm.build_snapshot().await.to_json()?;

        *store.vote.write().await = Some(Vote::new(log_id.leader_id.term, log_id.leader_id.node_id));
        *store.last_purged_log_id.write().await = Some(log_id);
        *store.last_applied_log.write().await = Some(log_id);
        *store.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: SnapshotMeta {
                last_log_id: Some(log_id),
                last_membership: membership.clone(),
                snapshot_id: format!("{}-{}-restored", store.sm.group_id(), log_id.index),
            },
            data,
        });
        *store.last_membership.write().await = membership;
        info!(
            group_id = %store.sm.group_id(),
            term = log_id.leader_id.term,
            index = log_id.index,
            "Resuming log after restored snapshot"
        );
        Ok(store)
    }

    pub fn state_machine(&self) -> Arc<ClusterStateMachine> {
        self.sm.clone()
    }

    fn handle(&self) -> Self {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            sm: self.sm.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
        }
    }

    async fn apply_entry(
        &self,
        entry: &Entry<TypeConfig>,
    ) -> Result<CommandResponse, StorageError<RaftNodeId>> {
        let position = log_position(&entry.log_id);
        let result = match &entry.payload {
            EntryPayload::Blank => self.sm.record_applied(position).await,
            EntryPayload::Normal(envelope) => self.sm.apply_envelope(position, envelope).await,
            EntryPayload::Membership(membership) => {
                let stored = StoredMembership::new(Some(entry.log_id), membership.clone());
                let value = serde_json::to_value(&stored).map_err(|e| {
                    storage_error(ErrorSubject::Apply(entry.log_id), ErrorVerb::Write, e)
                })?;
                *self.last_membership.write().await = stored;
                self.sm.record_membership(position, value).await
            }
        };

        match result {
            Ok(response) => Ok(response),
            Err(e @ (CoordinationError::LogGap { .. } | CoordinationError::LogConflict { .. })) => {
                error!(log_id = %entry.log_id, error = %e, "State machine diverged from the log");
                Err(storage_error(
                    ErrorSubject::Apply(entry.log_id),
                    ErrorVerb::Write,
                    e,
                ))
            }
            Err(e) => Ok(CommandResponse::Failed {
                kind: e.as_metric_label().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.handle()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.log.write().await.retain(|index, _| *index < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);

        self.log.write().await.retain(|index, _| *index > log_id.index);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut last_applied = self.last_applied_log.write().await;

        for entry in entries {
            let value = serde_json::to_value(entry.log_id).map_err(|e| {
                storage_error(ErrorSubject::Apply(entry.log_id), ErrorVerb::Write, e)
            })?;
            self.sm.stage_log_id(entry.log_id.index, value).await;
            let response = self.apply_entry(entry).await?;
            *last_applied = Some(entry.log_id);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.handle()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();
        let subject = ErrorSubject::Snapshot(Some(meta.signature()));
        let parsed = ClusterSnapshot::from_json(&data)
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Read, e))?;

        let mut last_applied = self.last_applied_log.write().await;
        self.sm
            .restore(parsed)
            .await
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Write, e))?;
        if let Some(log_id) = meta.last_log_id {
            let value = serde_json::to_value(log_id)
                .map_err(|e| storage_error(subject.clone(), ErrorVerb::Write, e))?;
            self.sm.record_log_id(value).await;
        }
        *last_applied = meta.last_log_id;
        *self.last_membership.write().await = meta.last_membership.clone();

        // Keep the installed state durable before acknowledging it.
        self.sm
            .take_snapshot()
            .await
            .map_err(|e| storage_error(subject, ErrorVerb::Write, e))?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Installed snapshot from leader"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        let snapshot_guard = self.cached_snapshot.read().await;
        Ok(snapshot_guard.as_ref().map(|cached| Snapshot {
            meta: cached.meta.clone(),
            snapshot: Box::new(Cursor::new(cached.data.clone())),
        }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let last_applied_guard = self.last_applied_log.read().await;
        let last_applied = *last_applied_guard;
        let membership = self.last_membership.read().await.clone();

        let snapshot = self.sm.take_snapshot().await.map_err(|e| {
            storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e)
        })?;
        drop(last_applied_guard);
        let data = snapshot
            .to_json()
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!(
                "{}-{}-{}",
                self.sm.group_id(),
                last_applied.map(|l| l.index).unwrap_or(0),
                snapshot.taken_at_ms
            ),
        };
        debug!(snapshot_id = %meta.snapshot_id, size_bytes = data.len(), "Built snapshot");

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let entries: Vec<_> = log.range(range).map(|(_, e)| e.clone()).collect();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::clock::ManualClock;
    use crate::cluster::raft::commands::{
        AssignPartitionCommand, RaftCommand, RaftCommandEnvelope, RevokePartitionCommand,
    };
    use crate::cluster::raft::snapshot::{FileSnapshotStore, SnapshotStore};
    use openraft::{Membership, RaftLogReader, RaftSnapshotBuilder};
    use std::collections::BTreeSet;

    fn create_test_store(dir: &std::path::Path) -> RaftStore {
        let sm = ClusterStateMachine::new(
            "g1",
            Arc::new(FileSnapshotStore::new(dir)),
            Arc::new(ManualClock::new(1_000)),
            0,
        );
        RaftStore::new(Arc::new(sm))
    }

    fn make_log_id(term: u64, node: u64, index: u64) -> LogId<RaftNodeId> {
        LogId::new(openraft::CommittedLeaderId::new(term, node), index)
    }

    fn make_entry(
        term: u64,
        node: u64,
        index: u64,
        payload: EntryPayload<TypeConfig>,
    ) -> Entry<TypeConfig> {
        Entry {
            log_id: make_log_id(term, node, index),
            payload,
        }
    }

    fn assign(group: &str, partition: i32) -> EntryPayload<TypeConfig> {
        EntryPayload::Normal(
            RaftCommandEnvelope::wrap(RaftCommand::AssignPartition(AssignPartitionCommand {
                group_id: group.into(),
                partition,
                owner_node_id: "node-1".into(),
                affinities: BTreeMap::new(),
                equipment_ids: vec![],
                workflow_handoff: None,
                timestamp_ms: 100,
            }))
            .unwrap(),
        )
    }

    fn membership() -> EntryPayload<TypeConfig> {
        let voters = BTreeSet::from([1u64]);
        let nodes = BTreeMap::from([(1u64, BasicNode::new("127.0.0.1:7001"))]);
        EntryPayload::Membership(Membership::new(vec![voters], nodes))
    }

    // ========================================================================
    // Log
    // ========================================================================

    #[tokio::test]
    async fn test_save_and_read_vote() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        assert!(store.read_vote().await.unwrap().is_none());

        store.save_vote(&Vote::new(1, 42)).await.unwrap();
        let vote = store.read_vote().await.unwrap().unwrap();
        assert_eq!(vote.leader_id().voted_for(), Some(42));
    }

    #[tokio::test]
    async fn test_log_state_and_conflict_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let entries = (1..=4).map(|i| make_entry(1, 0, i, EntryPayload::Blank));
        store.append_to_log(entries).await.unwrap();
        assert_eq!(store.get_log_state().await.unwrap().last_log_id.unwrap().index, 4);

        store
            .delete_conflict_logs_since(make_log_id(1, 0, 3))
            .await
            .unwrap();
        let remaining = store.try_get_log_entries(0..).await.unwrap();
        assert_eq!(
            remaining.iter().map(|e| e.log_id.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_last_purged_as_last_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let entries = (1..=3).map(|i| make_entry(1, 0, i, EntryPayload::Blank));
        store.append_to_log(entries).await.unwrap();

        store.purge_logs_upto(make_log_id(1, 0, 3)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 3);
        assert_eq!(state.last_log_id.unwrap().index, 3);
        assert!(store.try_get_log_entries(0..).await.unwrap().is_empty());
    }

    // ========================================================================
    // Apply
    // ========================================================================

    #[tokio::test]
    async fn test_apply_mixed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let entries = vec![
            make_entry(1, 1, 0, membership()),
            make_entry(1, 1, 1, EntryPayload::Blank),
            make_entry(1, 1, 2, assign("g1", 0)),
        ];

        let responses = store.apply_to_state_machine(&entries).await.unwrap();
        assert_eq!(responses[0], CommandResponse::Ok);
        assert_eq!(responses[1], CommandResponse::Ok);
        assert!(matches!(responses[2], CommandResponse::PartitionAssigned(_)));

        let (applied, membership) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 2);
        assert_eq!(membership.log_id().unwrap().index, 0);
        assert!(store.state_machine().membership().await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_command_becomes_failed_response() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let foreign = EntryPayload::Normal(
            RaftCommandEnvelope::wrap(RaftCommand::RevokePartition(RevokePartitionCommand {
                group_id: "other".into(),
                partition: 0,
                reason: "test".into(),
                timestamp_ms: 0,
            }))
            .unwrap(),
        );

        let responses = store
            .apply_to_state_machine(&[make_entry(1, 1, 1, foreign)])
            .await
            .unwrap();
        assert!(matches!(
            &responses[0],
            CommandResponse::Failed { kind, .. } if kind == "group_mismatch"
        ));
        assert_eq!(store.last_applied_state().await.unwrap().0.unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_gap_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        store
            .apply_to_state_machine(&[make_entry(1, 1, 1, EntryPayload::Blank)])
            .await
            .unwrap();
        assert!(
            store
                .apply_to_state_machine(&[make_entry(1, 1, 5, EntryPayload::Blank)])
                .await
                .is_err()
        );
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    #[tokio::test]
    async fn test_build_and_install_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut leader = create_test_store(dir.path());
        let entries = vec![
            make_entry(1, 1, 0, membership()),
            make_entry(1, 1, 1, assign("g1", 0)),
            make_entry(1, 1, 2, assign("g1", 1)),
        ];
        leader.apply_to_state_machine(&entries).await.unwrap();

        let snapshot = leader.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 2);
        assert!(leader.get_current_snapshot().await.unwrap().is_some());

        let follower_dir = tempfile::tempdir().unwrap();
        let mut follower = create_test_store(follower_dir.path());
        follower
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        let sm = follower.state_machine();
        assert_eq!(sm.assignments().await.len(), 2);
        assert_eq!(sm.last_applied().await, Some(LogPosition::new(1, 2)));
        assert_eq!(
            follower.last_applied_state().await.unwrap().0.unwrap().index,
            2
        );

        let persisted = FileSnapshotStore::new(follower_dir.path())
            .load_latest("g1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.index, 2);
    }

    #[tokio::test]
    async fn test_open_resumes_after_restored_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut before = create_test_store(dir.path());
        let entries = vec![
            make_entry(1, 1, 0, membership()),
            make_entry(2, 1, 1, assign("g1", 0)),
            make_entry(2, 1, 2, assign("g1", 1)),
        ];
        before.apply_to_state_machine(&entries).await.unwrap();
        before.build_snapshot().await.unwrap();

        let sm = create_test_store(dir.path()).state_machine();
        assert!(sm.start().await.unwrap());
        let mut after = RaftStore::open(sm).await.unwrap();

        let (applied, membership) = after.last_applied_state().await.unwrap();
        assert_eq!(applied, Some(make_log_id(2, 1, 2)));
        assert_eq!(membership.log_id().unwrap().index, 0);
        let state = after.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(make_log_id(2, 1, 2)));
        assert_eq!(state.last_log_id, Some(make_log_id(2, 1, 2)));
        assert_eq!(after.read_vote().await.unwrap(), Some(Vote::new(2, 1)));
        let current = after.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.last_log_id, Some(make_log_id(2, 1, 2)));

        // the next entry continues the numbering and is applied
        let responses = after
            .apply_to_state_machine(&[make_entry(3, 1, 3, assign("g1", 2))])
            .await
            .unwrap();
        assert!(matches!(responses[0], CommandResponse::PartitionAssigned(_)));
        assert!(after.state_machine().find_assignment(2).await.is_some());
    }

    #[tokio::test]
    async fn test_open_without_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sm = create_test_store(dir.path()).state_machine();
        assert!(!sm.start().await.unwrap());
        let mut store = RaftStore::open(sm).await.unwrap();
        assert!(store.last_applied_state().await.unwrap().0.is_none());
        assert!(store.read_vote().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_install_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let meta = SnapshotMeta {
            last_log_id: Some(make_log_id(1, 1, 3)),
            last_membership: StoredMembership::default(),
            snapshot_id: "bad".into(),
        };
        let result = store
            .install_snapshot(&meta, Box::new(Cursor::new(b"not json".to_vec())))
            .await;
        assert!(result.is_err());
        assert!(store.last_applied_state().await.unwrap().0.is_none());
    }
}
