//! Assignment service backed by the replicated log.
//!
//! Writes become commands proposed through a [`CommandProposer`]; reads come
//! from the local [`ClusterStateMachine`] and may trail the leader by the
//! apply latency.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use super::commands::{
    AssignKeyCommand, AssignPartitionCommand, CommandResponse, RaftCommand,
    RevokePartitionCommand, UnassignKeyCommand,
};
use super::proposer::{CommandProposer, unexpected};
use super::state_machine::ClusterStateMachine;
use crate::cluster::assignment::{
    Assignment, AssignmentService, KeyAssignment, KeyAssignmentMap, KeyAssignmentSource,
    TopologyEvent, validate_assignments, validate_group, validate_key,
};
use crate::cluster::clock::Clock;
use crate::cluster::error::{CoordinationError, CoordinationResult};

pub struct RaftAssignmentService {
    proposer: Arc<dyn CommandProposer>,
    state_machine: Arc<ClusterStateMachine>,
    clock: Arc<dyn Clock>,
}

impl RaftAssignmentService {
    pub fn new(proposer: Arc<dyn CommandProposer>, state_machine: Arc<ClusterStateMachine>) -> Self {
        let clock = state_machine.clock();
        Self {
            proposer,
            state_machine,
            clock,
        }
    }

    /// The state machine holds exactly one group.
    fn check_group(&self, group_id: &str) -> CoordinationResult<()> {
        validate_group(group_id)?;
        if group_id != self.state_machine.group_id() {
            return Err(CoordinationError::GroupMismatch {
                machine_group: self.state_machine.group_id().to_string(),
                command_group: group_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentService for RaftAssignmentService {
    async fn apply_assignments(
        &self,
        group_id: &str,
        assignments: Vec<Assignment>,
    ) -> CoordinationResult<Vec<Assignment>> {
        validate_assignments(group_id, &assignments)?;
        self.check_group(group_id)?;

        let mut stored = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let command = RaftCommand::AssignPartition(AssignPartitionCommand {
                group_id: group_id.to_string(),
                partition: assignment.partition,
                owner_node_id: assignment.owner_node_id,
                affinities: assignment.affinities,
                equipment_ids: Vec::new(),
                workflow_handoff: assignment.workflow_handoff,
                timestamp_ms: self.clock.now_ms(),
            });
            match self.proposer.propose(command).await? {
                CommandResponse::PartitionAssigned(a) => stored.push(a),
                other => return Err(unexpected(other)),
            }
        }
        info!(group_id, count = stored.len(), "Replicated assignments");
        Ok(stored)
    }

    async fn revoke_assignments(
        &self,
        group_id: &str,
        partitions: &[i32],
        reason: &str,
    ) -> CoordinationResult<Vec<Assignment>> {
        self.check_group(group_id)?;

        let mut revoked = Vec::new();
        for &partition in partitions {
            let command = RaftCommand::RevokePartition(RevokePartitionCommand {
                group_id: group_id.to_string(),
                partition,
                reason: reason.to_string(),
                timestamp_ms: self.clock.now_ms(),
            });
            match self.proposer.propose(command).await? {
                CommandResponse::PartitionRevoked(previous) => revoked.extend(previous),
                other => return Err(unexpected(other)),
            }
        }
        info!(group_id, count = revoked.len(), reason, "Replicated revocations");
        Ok(revoked)
    }

    async fn find_assignment(
        &self,
        group_id: &str,
        partition: i32,
    ) -> CoordinationResult<Option<Assignment>> {
        self.check_group(group_id)?;
        Ok(self.state_machine.find_assignment(partition).await)
    }

    async fn assign_key(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
        app_id: &str,
        source: KeyAssignmentSource,
    ) -> CoordinationResult<KeyAssignment> {
        validate_key(group_id, kind, key, app_id)?;
        self.check_group(group_id)?;

        let command = RaftCommand::AssignKey(AssignKeyCommand {
            group_id: group_id.to_string(),
            partition,
            kind: kind.to_string(),
            key: key.to_string(),
            app_id: app_id.to_string(),
            source,
            timestamp_ms: self.clock.now_ms(),
        });
        match self.proposer.propose(command).await? {
            CommandResponse::KeyAssigned(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    async fn get_key_assignment(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<Option<KeyAssignment>> {
        self.check_group(group_id)?;
        Ok(self.state_machine.key_assignment(partition, kind, key).await)
    }

    async fn unassign_key(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<bool> {
        self.check_group(group_id)?;

        let command = RaftCommand::UnassignKey(UnassignKeyCommand {
            group_id: group_id.to_string(),
            partition,
            kind: kind.to_string(),
            key: key.to_string(),
            timestamp_ms: self.clock.now_ms(),
        });
        match self.proposer.propose(command).await? {
            CommandResponse::KeyUnassigned { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    async fn snapshot_assignments(
        &self,
        group_id: &str,
    ) -> CoordinationResult<BTreeMap<i32, Assignment>> {
        self.check_group(group_id)?;
        Ok(self.state_machine.assignments().await)
    }

    async fn snapshot_key_assignments(
        &self,
        group_id: &str,
    ) -> CoordinationResult<KeyAssignmentMap> {
        self.check_group(group_id)?;
        Ok(self.state_machine.key_assignments().await)
    }

    /// Replicated state only changes through the log; install a state
    /// machine snapshot instead.
    async fn restore_snapshot(
        &self,
        _group_id: &str,
        _assignments: BTreeMap<i32, Assignment>,
        _key_assignments: KeyAssignmentMap,
    ) -> CoordinationResult<()> {
        Err(CoordinationError::InvalidArgument(
            "replicated assignments are restored from state machine snapshots".into(),
        ))
    }

    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.state_machine.topology_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::assignment::{AssignmentServiceExt, TopologyEventType};
    use crate::cluster::clock::ManualClock;
    use crate::cluster::raft::proposer::DirectProposer;
    use crate::cluster::raft::snapshot::FileSnapshotStore;

    fn service(dir: &std::path::Path) -> RaftAssignmentService {
        let sm = Arc::new(ClusterStateMachine::new(
            "g1",
            Arc::new(FileSnapshotStore::new(dir)),
            Arc::new(ManualClock::new(5_000)),
            0,
        ));
        RaftAssignmentService::new(Arc::new(DirectProposer::new(sm.clone())), sm)
    }

    #[tokio::test]
    async fn test_apply_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let mut events = service.topology_events();

        let stored = service
            .apply_assignments(
                "g1",
                vec![
                    Assignment::new("g1", 0, "node-1").with_equipment_ids(["eq-1"]),
                    Assignment::new("g1", 1, "node-2"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].version, 1);
        assert_eq!(stored[0].updated_at_ms, 5_000);

        let found = service.find_assignment("g1", 0).await.unwrap().unwrap();
        assert_eq!(found.equipment_ids(), ["eq-1".to_string()]);
        assert_eq!(events.try_recv().unwrap().event_type, TopologyEventType::Assigned);
    }

    #[tokio::test]
    async fn test_key_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service
            .apply_assignments("g1", vec![Assignment::new("g1", 3, "node-1")])
            .await
            .unwrap();

        let key = service
            .assign_default_key("g1", 3, "eq-9", "app-1", KeyAssignmentSource::Manual)
            .await
            .unwrap();
        assert_eq!(key.kind, "equipmentId");
        assert_eq!(key.version, 1);
        assert!(
            service
                .get_default_key_assignment("g1", 3, "eq-9")
                .await
                .unwrap()
                .is_some()
        );

        assert!(service.unassign_default_key("g1", 3, "eq-9").await.unwrap());
        assert!(!service.unassign_default_key("g1", 3, "eq-9").await.unwrap());

        let revoked = service
            .revoke_assignments("g1", &[3, 4], "test")
            .await
            .unwrap();
        assert_eq!(revoked.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_group_rejected_without_proposing() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let err = service
            .apply_assignments("other", vec![Assignment::new("other", 0, "node-1")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::GroupMismatch { .. }));
        assert!(service.find_assignment("other", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_snapshot_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(matches!(
            service
                .restore_snapshot("g1", BTreeMap::new(), KeyAssignmentMap::new())
                .await,
            Err(CoordinationError::InvalidArgument(_))
        ));
    }
}
