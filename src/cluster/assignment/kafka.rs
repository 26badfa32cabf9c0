//! Bridges from Kafka consumer-group rebalances to the assignment service.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{
    AffinityKeyExtractor, Assignment, AssignmentService, AssignmentServiceExt, KeyAssignment,
    KeyAssignmentSource, TopologyEvent,
};
use crate::cluster::error::CoordinationResult;

/// Revocation reason used for consumer-group rebalances.
pub const KAFKA_REBALANCE_REASON: &str = "kafka-rebalance";

/// Turns partition assignment callbacks into assignment service writes.
pub struct KafkaAssignmentCoordinator {
    service: Arc<dyn AssignmentService>,
}

impl KafkaAssignmentCoordinator {
    pub fn new(service: Arc<dyn AssignmentService>) -> Self {
        Self { service }
    }

    /// Record `node_id` as owner of every partition Kafka just handed it.
    pub async fn on_partitions_assigned(
        &self,
        group_id: &str,
        node_id: &str,
        partitions: &[i32],
        affinities: &BTreeMap<String, Vec<String>>,
    ) -> CoordinationResult<Vec<Assignment>> {
        let requests = partitions
            .iter()
            .map(|p| Assignment::new(group_id, *p, node_id).with_affinities(affinities.clone()))
            .collect();
        let stored = self.service.apply_assignments(group_id, requests).await?;
        info!(group_id, node_id, partitions = ?partitions, "Kafka partitions assigned");
        Ok(stored)
    }

    pub async fn on_partitions_revoked(
        &self,
        group_id: &str,
        partitions: &[i32],
        reason: &str,
    ) -> CoordinationResult<Vec<Assignment>> {
        self.service
            .revoke_assignments(group_id, partitions, reason)
            .await
    }

    /// Revocation triggered by a consumer-group rebalance.
    pub async fn on_rebalance_revoked(
        &self,
        group_id: &str,
        partitions: &[i32],
    ) -> CoordinationResult<Vec<Assignment>> {
        self.on_partitions_revoked(group_id, partitions, KAFKA_REBALANCE_REASON)
            .await
    }
}

/// Assigns record keys for one group using a fixed extractor.
pub struct KafkaKeyAssignmentAdapter<E> {
    service: Arc<dyn AssignmentService>,
    group_id: String,
    extractor: E,
}

impl<E> KafkaKeyAssignmentAdapter<E> {
    pub fn new(service: Arc<dyn AssignmentService>, group_id: impl Into<String>, extractor: E) -> Self {
        Self {
            service,
            group_id: group_id.into(),
            extractor,
        }
    }

    /// `None` when the record carries no key.
    pub async fn assign_key<T>(
        &self,
        partition: i32,
        record: &T,
        app_id: &str,
        source: KeyAssignmentSource,
    ) -> CoordinationResult<Option<KeyAssignment>>
    where
        T: ?Sized + Sync,
        E: AffinityKeyExtractor<T>,
    {
        self.service
            .assign_key_with(&self.group_id, partition, record, &self.extractor, app_id, source)
            .await
    }
}

/// Tracks the affinity kind seen on topology events and publishes changes.
///
/// The kind of an assignment event is its first affinity kind; a key event
/// uses its key assignment's kind.
pub struct AffinityKindMonitor {
    kinds: watch::Receiver<Option<String>>,
    handle: JoinHandle<()>,
}

impl AffinityKindMonitor {
    pub fn start(mut events: broadcast::Receiver<TopologyEvent>) -> Self {
        let (tx, kinds) = watch::channel(None);
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Affinity kind monitor lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(kind) = kind_of(&event) else {
                    continue;
                };
                let changed = tx.send_if_modified(|current| {
                    if current.as_deref() == Some(kind) {
                        false
                    } else {
                        *current = Some(kind.to_string());
                        true
                    }
                });
                if changed {
                    info!(kind, "Affinity kind changed");
                }
            }
        });
        Self { kinds, handle }
    }

    pub fn last_kind(&self) -> Option<String> {
        self.kinds.borrow().clone()
    }

    /// Receiver that is notified each time the kind changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.kinds.clone()
    }
}

impl Drop for AffinityKindMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn kind_of(event: &TopologyEvent) -> Option<&str> {
    if let Some(assignment) = &event.assignment {
        return assignment.affinities.keys().next().map(String::as_str);
    }
    event.key_assignment.as_ref().map(|k| k.kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::assignment::{InMemoryAssignmentService, JsonFieldExtractor};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_coordinator_assigns_and_revokes() {
        let service = Arc::new(InMemoryAssignmentService::new());
        let coordinator = KafkaAssignmentCoordinator::new(service.clone());
        let affinities = BTreeMap::from([("equipmentId".to_string(), vec!["EQP-1".to_string()])]);

        let stored = coordinator
            .on_partitions_assigned("g1", "node-1", &[0, 1], &affinities)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(
            service.find_assignment("g1", 1).await.unwrap().unwrap().equipment_ids(),
            ["EQP-1"]
        );

        let revoked = coordinator.on_rebalance_revoked("g1", &[0]).await.unwrap();
        assert_eq!(revoked.len(), 1);
        assert!(service.find_assignment("g1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_adapter_uses_extractor() {
        let service = Arc::new(InMemoryAssignmentService::new());
        let adapter =
            KafkaKeyAssignmentAdapter::new(service.clone(), "g1", JsonFieldExtractor::new("lotId", "lot"));

        let assigned = adapter
            .assign_key(3, &json!({"lot": "L-7"}), "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assigned.kind, "lotId");
        assert!(adapter
            .assign_key(3, &json!({}), "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_affinity_kind_monitor_emits_changes_only() {
        let service = Arc::new(InMemoryAssignmentService::new());
        let monitor = AffinityKindMonitor::start(service.topology_events());
        let mut kinds = monitor.subscribe();

        let affinities = BTreeMap::from([("equipmentId".to_string(), vec!["EQP-1".to_string()])]);
        service
            .apply_assignments(
                "g1",
                vec![Assignment::new("g1", 0, "node-1").with_affinities(affinities)],
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), kinds.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.last_kind().as_deref(), Some("equipmentId"));

        // partition 5 has no assignment, so the key's own kind is used
        service
            .assign_key("g1", 5, "lotId", "L-1", "app-1", KeyAssignmentSource::Auto)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), kinds.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.last_kind().as_deref(), Some("lotId"));
    }
}
