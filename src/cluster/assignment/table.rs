//! Deterministic assignment state for one group.
//!
//! Pure data plus mutation methods that take the timestamp as an argument,
//! so the same sequence of calls produces the same table on every replica.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    Assignment, KeyAssignment, KeyAssignmentMap, KeyAssignmentSource, TopologyEvent,
    TopologyEventType,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentTable {
    assignments: BTreeMap<i32, Assignment>,
    key_assignments: KeyAssignmentMap,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        assignments: BTreeMap<i32, Assignment>,
        key_assignments: KeyAssignmentMap,
    ) -> Self {
        Self {
            assignments,
            key_assignments,
        }
    }

    pub fn assignments(&self) -> &BTreeMap<i32, Assignment> {
        &self.assignments
    }

    pub fn key_assignments(&self) -> &KeyAssignmentMap {
        &self.key_assignments
    }

    pub fn assignment(&self, partition: i32) -> Option<&Assignment> {
        self.assignments.get(&partition)
    }

    pub fn key_assignment(&self, partition: i32, kind: &str, key: &str) -> Option<&KeyAssignment> {
        self.key_assignments.get(&partition)?.get(kind)?.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.key_assignments.is_empty()
    }

    /// Store `request` for its partition with the next version.
    pub fn apply(
        &mut self,
        group_id: &str,
        request: Assignment,
        now_ms: u64,
    ) -> (Assignment, TopologyEvent) {
        let previous = self.assignments.get(&request.partition).map(|a| a.version);
        let stored = Assignment {
            group_id: group_id.to_string(),
            version: previous.map_or(1, |v| v + 1),
            updated_at_ms: now_ms,
            ..request
        };
        self.assignments.insert(stored.partition, stored.clone());

        let event_type = if previous.is_some() {
            TopologyEventType::Updated
        } else {
            TopologyEventType::Assigned
        };
        let event = TopologyEvent {
            event_type,
            assignment: Some(stored.clone()),
            key_assignment: None,
            emitted_at_ms: now_ms,
        };
        (stored, event)
    }

    /// Drop `partition` and all of its key assignments. `None` if it was
    /// not assigned.
    pub fn revoke(&mut self, partition: i32, now_ms: u64) -> Option<TopologyEvent> {
        self.key_assignments.remove(&partition);
        let removed = self.assignments.remove(&partition)?;
        Some(TopologyEvent {
            event_type: TopologyEventType::Revoked,
            assignment: Some(removed),
            key_assignment: None,
            emitted_at_ms: now_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn assign_key(
        &mut self,
        group_id: &str,
        partition: i32,
        kind: &str,
        key: &str,
        app_id: &str,
        source: KeyAssignmentSource,
        now_ms: u64,
    ) -> (KeyAssignment, TopologyEvent) {
        let by_key = self
            .key_assignments
            .entry(partition)
            .or_default()
            .entry(kind.to_string())
            .or_default();
        let version = by_key.get(key).map_or(1, |k| k.version + 1);
        let stored = KeyAssignment {
            group_id: group_id.to_string(),
            partition,
            kind: kind.to_string(),
            key: key.to_string(),
            app_id: app_id.to_string(),
            assigned_by: source,
            version,
            updated_at_ms: now_ms,
        };
        by_key.insert(key.to_string(), stored.clone());

        let event = TopologyEvent {
            event_type: TopologyEventType::KeyAssigned,
            assignment: self.assignments.get(&partition).cloned(),
            key_assignment: Some(stored.clone()),
            emitted_at_ms: now_ms,
        };
        (stored, event)
    }

    /// Remove one key assignment. `None` if there was nothing to remove.
    pub fn unassign_key(
        &mut self,
        partition: i32,
        kind: &str,
        key: &str,
        now_ms: u64,
    ) -> Option<TopologyEvent> {
        let by_kind = self.key_assignments.get_mut(&partition)?;
        let by_key = by_kind.get_mut(kind)?;
        let removed = by_key.remove(key)?;

        if by_key.is_empty() {
            by_kind.remove(kind);
        }
        if by_kind.is_empty() {
            self.key_assignments.remove(&partition);
        }

        Some(TopologyEvent {
            event_type: TopologyEventType::KeyUnassigned,
            assignment: self.assignments.get(&partition).cloned(),
            key_assignment: Some(removed),
            emitted_at_ms: now_ms,
        })
    }

    /// Replace all state.
    pub fn replace(&mut self, assignments: BTreeMap<i32, Assignment>, key_assignments: KeyAssignmentMap) {
        self.assignments = assignments;
        self.key_assignments = key_assignments;
    }
}
