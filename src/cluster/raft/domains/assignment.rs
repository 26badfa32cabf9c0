//! Assignment domain for the replicated state machine.

use serde::{Deserialize, Serialize};

use crate::cluster::assignment::{AssignmentTable, TopologyEvent};
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::raft::commands::{
    AssignKeyCommand, AssignPartitionCommand, CommandResponse, RevokePartitionCommand,
    UnassignKeyCommand,
};

/// Assignment state of the one group this state machine replicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDomainState {
    group_id: String,
    table: AssignmentTable,
}

/// Response plus the topology event to publish, if any.
pub type DomainOutcome = (CommandResponse, Option<TopologyEvent>);

impl AssignmentDomainState {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            table: AssignmentTable::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn table(&self) -> &AssignmentTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AssignmentTable {
        &mut self.table
    }

    /// A command for another group must never be applied here.
    pub fn check_group(&self, command_group: &str) -> CoordinationResult<()> {
        if command_group != self.group_id {
            return Err(CoordinationError::GroupMismatch {
                machine_group: self.group_id.clone(),
                command_group: command_group.to_string(),
            });
        }
        Ok(())
    }

    pub fn assign_partition(&mut self, cmd: &AssignPartitionCommand) -> CoordinationResult<DomainOutcome> {
        self.check_group(&cmd.group_id)?;
        let (stored, event) = self
            .table
            .apply(&self.group_id, cmd.to_assignment(), cmd.timestamp_ms);
        Ok((CommandResponse::PartitionAssigned(stored), Some(event)))
    }

    pub fn revoke_partition(&mut self, cmd: &RevokePartitionCommand) -> CoordinationResult<DomainOutcome> {
        self.check_group(&cmd.group_id)?;
        let event = self.table.revoke(cmd.partition, cmd.timestamp_ms);
        let removed = event.as_ref().and_then(|e| e.assignment.clone());
        Ok((CommandResponse::PartitionRevoked(removed), event))
    }

    pub fn assign_key(&mut self, cmd: &AssignKeyCommand) -> CoordinationResult<DomainOutcome> {
        self.check_group(&cmd.group_id)?;
        let (stored, event) = self.table.assign_key(
            &self.group_id,
            cmd.partition,
            &cmd.kind,
            &cmd.key,
            &cmd.app_id,
            cmd.source,
            cmd.timestamp_ms,
        );
        Ok((CommandResponse::KeyAssigned(stored), Some(event)))
    }

    pub fn unassign_key(&mut self, cmd: &UnassignKeyCommand) -> CoordinationResult<DomainOutcome> {
        self.check_group(&cmd.group_id)?;
        let event = self
            .table
            .unassign_key(cmd.partition, &cmd.kind, &cmd.key, cmd.timestamp_ms);
        Ok((
            CommandResponse::KeyUnassigned {
                removed: event.is_some(),
            },
            event,
        ))
    }
}
