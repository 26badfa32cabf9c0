//! Single-node assignment service.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    Assignment, AssignmentService, AssignmentTable, KeyAssignment, KeyAssignmentMap,
    KeyAssignmentSource, TopologyEvent, validate_assignments, validate_group, validate_key,
};
use crate::cluster::clock::{Clock, SystemClock};
use crate::cluster::error::CoordinationResult;
use crate::cluster::metrics;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// [`AssignmentService`] over a process-local map of [`AssignmentTable`]s.
pub struct InMemoryAssignmentService {
    groups: DashMap<String, AssignmentTable>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Default for InMemoryAssignmentService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAssignmentService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            groups: DashMap::new(),
            clock,
            events,
        }
    }

    /// Called with the group's entry guard held, so subscribers see events
    /// in the order the table changed.
    fn publish(&self, events: &[TopologyEvent]) {
        for event in events {
            metrics::record_topology_event(event.event_type.as_str());
            let _ = self.events.send(event.clone());
        }
    }
}

#[async_trait]
impl AssignmentService for InMemoryAssignmentService {
    async fn apply_assignments(
        &self,
        group_id: &str,
        assignments: Vec<Assignment>,
    ) -> CoordinationResult<Vec<Assignment>> {
        validate_assignments(group_id, &assignments)?;
        let now = self.clock.now_ms();

        let stored: Vec<Assignment> = {
            let mut table = self.groups.entry(group_id.to_string()).or_default();
            let (stored, events): (Vec<Assignment>, Vec<TopologyEvent>) = assignments
                .into_iter()
                .map(|a| table.apply(group_id, a, now))
                .unzip();
            self.publish(&events);
            stored
        };

        for a in &stored {
            info!(group_id, partition = a.partition, owner = %a.owner_node_id, version = a.version, "Assignment applied");
        }
        Ok(stored)
    }

    async fn revoke_assignments(
        &self,
        group_id: &str,
        partitions: &[i32],
        reason: &str,
    ) -> CoordinationResult<Vec<Assignment>> {
        validate_group(group_id)?;
        let now = self.clock.now_ms();

        let events: Vec<TopologyEvent> = match self.groups.get_mut(group_id) {
            Some(mut table) => {
                let events: Vec<TopologyEvent> = partitions
                    .iter()
                    .filter_map(|p| table.revoke(*p, now))
                    .collect();
                self.publish(&events);
                events
            }
            None => Vec::new(),
        };

        let revoked: Vec<Assignment> = events.iter().filter_map(|e| e.assignment.clone()).collect();
        for a in &revoked {
            info!(group_id, partition = a.partition, reason, "Assignment revoked");
        }
        if revoked.len() < partitions.len() {
            debug!(group_id, requested = partitions.len(), revoked = revoked.len(), "Some partitions were not assigned");
        }
        Ok(revoked)
    }

    async fn find_assignment(
        &self,
        group_id: &str,
        partition: i32,
    ) -> CoordinationResult<Option<Assignment>> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|t| t.assignment(partition).cloned()))
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
        let now = self.clock.now_ms();

        let stored = {
            let mut table = self.groups.entry(group_id.to_string()).or_default();
            let (stored, event) = table.assign_key(group_id, partition, kind, key, app_id, source, now);
            self.publish(std::slice::from_ref(&event));
            stored
        };

        debug!(group_id, partition, kind, key, app_id, version = stored.version, "Key assigned");
        Ok(stored)
    }

    async fn get_key_assignment(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<Option<KeyAssignment>> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|t| t.key_assignment(partition, kind, key).cloned()))
    }

    async fn unassign_key(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<bool> {
        let now = self.clock.now_ms();
        let removed = self.groups.get_mut(group_id).is_some_and(|mut t| {
            match t.unassign_key(partition, kind, key, now) {
                Some(event) => {
                    self.publish(std::slice::from_ref(&event));
                    true
                }
                None => false,
            }
        });

        if removed {
            debug!(group_id, partition, kind, key, "Key unassigned");
        }
        Ok(removed)
    }

    async fn snapshot_assignments(
        &self,
        group_id: &str,
    ) -> CoordinationResult<BTreeMap<i32, Assignment>> {
        Ok(self
            .groups
            .get(group_id)
            .map(|t| t.assignments().clone())
            .unwrap_or_default())
    }

    async fn snapshot_key_assignments(
        &self,
        group_id: &str,
    ) -> CoordinationResult<KeyAssignmentMap> {
        Ok(self
            .groups
            .get(group_id)
            .map(|t| t.key_assignments().clone())
            .unwrap_or_default())
    }

    async fn restore_snapshot(
        &self,
        group_id: &str,
        assignments: BTreeMap<i32, Assignment>,
        key_assignments: KeyAssignmentMap,
    ) -> CoordinationResult<()> {
        validate_group(group_id)?;
        let partitions = assignments.len();
        self.groups
            .insert(group_id.to_string(), AssignmentTable::from_parts(assignments, key_assignments));
        info!(group_id, partitions, "Assignments restored from snapshot");
        Ok(())
    }

    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::assignment::{
        AssignmentServiceExt, JsonFieldExtractor, TopologyEventType,
    };
    use crate::cluster::clock::ManualClock;
    use crate::cluster::error::CoordinationError;
    use serde_json::json;

    fn service() -> InMemoryAssignmentService {
        InMemoryAssignmentService::with_clock(Arc::new(ManualClock::new(1_000)))
    }

    #[tokio::test]
    async fn test_apply_emits_assigned_then_updated() {
        let service = service();
        let mut events = service.topology_events();

        for n in 1..=3u64 {
            let stored = service
                .apply_assignments("g1", vec![Assignment::new("g1", 0, "node-1")])
                .await
                .unwrap();
            assert_eq!(stored[0].version, n);
        }

        assert_eq!(events.try_recv().unwrap().event_type, TopologyEventType::Assigned);
        assert_eq!(events.try_recv().unwrap().event_type, TopologyEventType::Updated);
        assert_eq!(events.try_recv().unwrap().event_type, TopologyEventType::Updated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_publish_in_version_order() {
        let service = Arc::new(service());
        let mut events = service.topology_events();

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let service = service.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        service
                            .apply_assignments("g1", vec![Assignment::new("g1", 0, format!("node-{w}"))])
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        for expected in 1..=200u64 {
            let event = events.try_recv().unwrap();
            assert_eq!(event.assignment.unwrap().version, expected);
        }
    }

    #[tokio::test]
    async fn test_invalid_batch_is_not_partially_applied() {
        let service = service();
        let err = service
            .apply_assignments(
                "g1",
                vec![Assignment::new("g1", 0, "node-1"), Assignment::new("g1", 1, "")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
        assert!(service.find_assignment("g1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_only_emits_for_existing() {
        let service = service();
        service
            .apply_assignments("g1", vec![Assignment::new("g1", 0, "node-1")])
            .await
            .unwrap();
        service
            .assign_default_key("g1", 0, "EQP-1", "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap();
        let mut events = service.topology_events();

        let revoked = service
            .revoke_assignments("g1", &[0, 1], "rebalance")
            .await
            .unwrap();
        assert_eq!(revoked.len(), 1);
        assert_eq!(events.try_recv().unwrap().event_type, TopologyEventType::Revoked);
        assert!(events.try_recv().is_err());
        assert!(service
            .get_default_key_assignment("g1", 0, "EQP-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_key_event_carries_assignment_context() {
        let service = service();
        service
            .apply_assignments("g1", vec![Assignment::new("g1", 0, "node-1")])
            .await
            .unwrap();
        let mut events = service.topology_events();

        service
            .assign_key("g1", 0, "lotId", "L-1", "app-1", KeyAssignmentSource::Manual)
            .await
            .unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, TopologyEventType::KeyAssigned);
        assert_eq!(event.assignment.unwrap().owner_node_id, "node-1");
        assert_eq!(event.key_assignment.unwrap().kind, "lotId");
    }

    #[tokio::test]
    async fn test_unassign_returns_whether_removed() {
        let service = service();
        service
            .assign_default_key("g1", 0, "EQP-1", "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap();

        assert!(service.unassign_default_key("g1", 0, "EQP-1").await.unwrap());
        assert!(!service.unassign_default_key("g1", 0, "EQP-1").await.unwrap());
        assert!(!service.unassign_key("other", 0, "x", "y").await.unwrap());
    }

    #[tokio::test]
    async fn test_assign_key_with_extractor() {
        let service = service();
        let extractor = JsonFieldExtractor::default_kind();

        let assigned = service
            .assign_key_with(
                "g1",
                2,
                &json!({"equipmentId": "EQP-9"}),
                &extractor,
                "app-1",
                KeyAssignmentSource::Auto,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assigned.key, "EQP-9");

        let missing = service
            .assign_key_with(
                "g1",
                2,
                &json!({"equipmentId": ""}),
                &extractor,
                "app-1",
                KeyAssignmentSource::Auto,
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let source = service();
        source
            .apply_assignments("g1", vec![Assignment::new("g1", 0, "node-1")])
            .await
            .unwrap();
        source
            .assign_default_key("g1", 0, "EQP-1", "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap();

        let assignments = source.snapshot_assignments("g1").await.unwrap();
        let keys = source.snapshot_key_assignments("g1").await.unwrap();

        let target = service();
        target.restore_snapshot("g1", assignments, keys).await.unwrap();
        assert_eq!(
            target.find_assignment("g1", 0).await.unwrap().unwrap().version,
            1
        );
        assert!(target
            .get_default_key_assignment("g1", 0, "EQP-1")
            .await
            .unwrap()
            .is_some());
    }
}
