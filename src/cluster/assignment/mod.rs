//! Versioned partition and key ownership.
//!
//! An [`Assignment`] says which node owns `(groupId, partition)`. A
//! [`KeyAssignment`] pins one affinity key (e.g. an `equipmentId`) inside a
//! partition to an application. Both carry their own version lineage:
//! the first write is version 1 and every later write adds exactly 1.
//!
//! Every mutation emits a [`TopologyEvent`]:
//!
//! | Operation | Event | When |
//! |-----------|-------|------|
//! | apply (new partition) | `ASSIGNED` | always |
//! | apply (existing partition) | `UPDATED` | always |
//! | revoke | `REVOKED` | only if a record existed |
//! | assign key | `KEY_ASSIGNED` | always |
//! | unassign key | `KEY_UNASSIGNED` | only if a record existed |
//!
//! Two backends implement [`AssignmentService`]:
//! [`InMemoryAssignmentService`] for a single node, and
//! `RaftAssignmentService` (in `raft::assignment`) which routes writes
//! through the replicated log.

mod kafka;
mod memory;
mod table;

pub use kafka::{AffinityKindMonitor, KAFKA_REBALANCE_REASON, KafkaAssignmentCoordinator, KafkaKeyAssignmentAdapter};
pub use memory::InMemoryAssignmentService;
pub use table::AssignmentTable;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::error::{CoordinationError, CoordinationResult};

/// Affinity kind used when a caller does not name one.
pub const DEFAULT_AFFINITY_KIND: &str = "equipmentId";

/// partition → kind → key → assignment.
pub type KeyAssignmentMap = BTreeMap<i32, BTreeMap<String, BTreeMap<String, KeyAssignment>>>;

fn default_kind() -> String {
    DEFAULT_AFFINITY_KIND.to_string()
}

/// Checkpoint a workflow hands to the next owner of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowHandoff {
    pub checkpoint: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub group_id: String,
    pub partition: i32,
    pub owner_node_id: String,
    #[serde(default)]
    pub affinities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub workflow_handoff: Option<WorkflowHandoff>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Assignment {
    /// Unversioned request for `partition`. Version and timestamp are set on apply.
    pub fn new(group_id: impl Into<String>, partition: i32, owner_node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            partition,
            owner_node_id: owner_node_id.into(),
            affinities: BTreeMap::new(),
            workflow_handoff: None,
            version: 0,
            updated_at_ms: 0,
        }
    }

    pub fn with_affinities(mut self, affinities: BTreeMap<String, Vec<String>>) -> Self {
        self.affinities = affinities;
        self
    }

    /// Set the default-kind affinity values.
    pub fn with_equipment_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.affinities.insert(
            DEFAULT_AFFINITY_KIND.to_string(),
            ids.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_handoff(mut self, handoff: WorkflowHandoff) -> Self {
        self.workflow_handoff = Some(handoff);
        self
    }

    pub fn affinity_values(&self, kind: &str) -> &[String] {
        self.affinities.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn equipment_ids(&self) -> &[String] {
        self.affinity_values(DEFAULT_AFFINITY_KIND)
    }
}

/// Who created a key assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAssignmentSource {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAssignment {
    pub group_id: String,
    pub partition: i32,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub key: String,
    pub app_id: String,
    pub assigned_by: KeyAssignmentSource,
    pub version: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopologyEventType {
    Assigned,
    Revoked,
    Updated,
    KeyAssigned,
    KeyUnassigned,
}

impl TopologyEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyEventType::Assigned => "ASSIGNED",
            TopologyEventType::Revoked => "REVOKED",
            TopologyEventType::Updated => "UPDATED",
            TopologyEventType::KeyAssigned => "KEY_ASSIGNED",
            TopologyEventType::KeyUnassigned => "KEY_UNASSIGNED",
        }
    }
}

/// One ownership change. Key events carry the partition's assignment, if
/// any, for context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEvent {
    pub event_type: TopologyEventType,
    pub assignment: Option<Assignment>,
    pub key_assignment: Option<KeyAssignment>,
    pub emitted_at_ms: u64,
}

/// Pulls an affinity key of one kind out of a record.
pub trait AffinityKeyExtractor<T: ?Sized>: Send + Sync {
    fn kind(&self) -> &str;

    /// The key, or `None` when the record has none.
    fn extract(&self, record: &T) -> Option<String>;
}

/// Reads a top-level JSON field as the affinity key.
#[derive(Debug, Clone)]
pub struct JsonFieldExtractor {
    kind: String,
    field: String,
}

impl JsonFieldExtractor {
    pub fn new(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
        }
    }

    /// Extractor for the default kind reading the field of the same name.
    pub fn default_kind() -> Self {
        Self::new(DEFAULT_AFFINITY_KIND, DEFAULT_AFFINITY_KIND)
    }
}

impl AffinityKeyExtractor<serde_json::Value> for JsonFieldExtractor {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn extract(&self, record: &serde_json::Value) -> Option<String> {
        match record.get(&self.field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Partition and key ownership for named groups.
#[async_trait]
pub trait AssignmentService: Send + Sync {
    /// Apply partition assignments, returning the stored versions.
    ///
    /// The whole batch is validated before anything is written.
    async fn apply_assignments(
        &self,
        group_id: &str,
        assignments: Vec<Assignment>,
    ) -> CoordinationResult<Vec<Assignment>>;

    /// Remove assignments and every key assignment under them.
    async fn revoke_assignments(
        &self,
        group_id: &str,
        partitions: &[i32],
        reason: &str,
    ) -> CoordinationResult<Vec<Assignment>>;

    async fn find_assignment(
        &self,
        group_id: &str,
        partition: i32,
    ) -> CoordinationResult<Option<Assignment>>;

    async fn assign_key(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
        app_id: &str,
        source: KeyAssignmentSource,
    ) -> CoordinationResult<KeyAssignment>;

    async fn get_key_assignment(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<Option<KeyAssignment>>;

    /// Returns whether a key assignment was removed.
    async fn unassign_key(
        &self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
    ) -> CoordinationResult<bool>;

    async fn snapshot_assignments(
        &self,
        group_id: &str,
    ) -> CoordinationResult<BTreeMap<i32, Assignment>>;

    async fn snapshot_key_assignments(&self, group_id: &str)
    -> CoordinationResult<KeyAssignmentMap>;

    /// Replace the group's state with a point-in-time dump.
    async fn restore_snapshot(
        &self,
        group_id: &str,
        assignments: BTreeMap<i32, Assignment>,
        key_assignments: KeyAssignmentMap,
    ) -> CoordinationResult<()>;

    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent>;
}

/// Default-kind and extractor conveniences for any [`AssignmentService`].
#[async_trait]
pub trait AssignmentServiceExt: AssignmentService {
    async fn assign_default_key(
        &self,
        group_id: &str,
        partition: i32,
        key: &str,
        app_id: &str,
        source: KeyAssignmentSource,
    ) -> CoordinationResult<KeyAssignment> {
        self.assign_key(group_id, partition, DEFAULT_AFFINITY_KIND, key, app_id, source)
            .await
    }

    async fn get_default_key_assignment(
        &self,
        group_id: &str,
        partition: i32,
        key: &str,
    ) -> CoordinationResult<Option<KeyAssignment>> {
        self.get_key_assignment(group_id, partition, DEFAULT_AFFINITY_KIND, key)
            .await
    }

    async fn unassign_default_key(
        &self,
        group_id: &str,
        partition: i32,
        key: &str,
    ) -> CoordinationResult<bool> {
        self.unassign_key(group_id, partition, DEFAULT_AFFINITY_KIND, key)
            .await
    }

    /// Assign the key `extractor` finds in `record`. `None` if the key is
    /// missing or empty.
    async fn assign_key_with<T, E>(
        &self,
        group_id: &str,
        partition: i32,
        record: &T,
        extractor: &E,
        app_id: &str,
        source: KeyAssignmentSource,
    ) -> CoordinationResult<Option<KeyAssignment>>
    where
        T: ?Sized + Sync,
        E: AffinityKeyExtractor<T> + ?Sized,
    {
        let Some(key) = extractor.extract(record).filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        self.assign_key(group_id, partition, extractor.kind(), &key, app_id, source)
            .await
            .map(Some)
    }
}

impl<S: AssignmentService + ?Sized> AssignmentServiceExt for S {}

pub(crate) fn validate_group(group_id: &str) -> CoordinationResult<()> {
    if group_id.trim().is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "groupId must not be empty".into(),
        ));
    }
    Ok(())
}

/// Reject the whole batch if any entry is invalid.
pub(crate) fn validate_assignments(
    group_id: &str,
    assignments: &[Assignment],
) -> CoordinationResult<()> {
    validate_group(group_id)?;
    for assignment in assignments {
        if assignment.group_id != group_id {
            return Err(CoordinationError::InvalidArgument(format!(
                "assignment for partition {} names group '{}', expected '{}'",
                assignment.partition, assignment.group_id, group_id
            )));
        }
        if assignment.partition < 0 {
            return Err(CoordinationError::InvalidArgument(format!(
                "partition ({}) must not be negative",
                assignment.partition
            )));
        }
        if assignment.owner_node_id.trim().is_empty() {
            return Err(CoordinationError::InvalidArgument(format!(
                "ownerNodeId must not be empty for partition {}",
                assignment.partition
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_key(
    group_id: &str,
    kind: &str,
    key: &str,
    app_id: &str,
) -> CoordinationResult<()> {
    validate_group(group_id)?;
    for (name, value) in [("kind", kind), ("key", key), ("appId", app_id)] {
        if value.trim().is_empty() {
            return Err(CoordinationError::InvalidArgument(format!(
                "{name} must not be empty"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_assignment_kind_defaults_on_decode() {
        let decoded: KeyAssignment = serde_json::from_value(json!({
            "groupId": "g1",
            "partition": 0,
            "key": "EQP-1",
            "appId": "app-1",
            "assignedBy": "AUTO",
            "version": 1,
            "updatedAtMs": 5
        }))
        .unwrap();
        assert_eq!(decoded.kind, DEFAULT_AFFINITY_KIND);
    }

    #[test]
    fn test_assignment_builders() {
        let a = Assignment::new("g1", 3, "node-1")
            .with_equipment_ids(["EQP-1", "EQP-2"])
            .with_handoff(WorkflowHandoff {
                checkpoint: "offset-42".into(),
                metadata: BTreeMap::new(),
            });
        assert_eq!(a.equipment_ids(), ["EQP-1", "EQP-2"]);
        assert!(a.affinity_values("lotId").is_empty());
        assert_eq!(a.workflow_handoff.unwrap().checkpoint, "offset-42");
    }

    #[test]
    fn test_json_field_extractor() {
        let extractor = JsonFieldExtractor::default_kind();
        assert_eq!(
            extractor.extract(&json!({"equipmentId": "EQP-7"})),
            Some("EQP-7".to_string())
        );
        assert_eq!(
            extractor.extract(&json!({"equipmentId": 12})),
            Some("12".to_string())
        );
        assert_eq!(extractor.extract(&json!({"lotId": "L-1"})), None);
        assert_eq!(extractor.kind(), "equipmentId");
    }

    #[test]
    fn test_validate_assignments_rejects_batch() {
        let good = Assignment::new("g1", 0, "node-1");
        let foreign = Assignment::new("g2", 1, "node-1");
        let orphan = Assignment::new("g1", 2, "");

        assert!(validate_assignments("g1", &[good.clone()]).is_ok());
        assert!(validate_assignments("g1", &[good.clone(), foreign]).is_err());
        assert!(validate_assignments("g1", &[good, orphan]).is_err());
        assert!(validate_assignments("", &[]).is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("g1", "equipmentId", "EQP-1", "app").is_ok());
        assert!(validate_key("g1", "", "EQP-1", "app").is_err());
        assert!(validate_key("g1", "equipmentId", "EQP-1", " ").is_err());
    }
}
