//! Write path into the replicated log.

use async_trait::async_trait;

use super::commands::{CommandResponse, RaftCommand, RaftCommandEnvelope};
use crate::cluster::error::{CoordinationError, CoordinationResult};

/// Submits commands to the log and waits for the local apply result.
#[async_trait]
pub trait CommandProposer: Send + Sync {
    /// Replicate `envelope` and return what the state machine answered.
    ///
    /// Fails with `NotLeader` on a follower.
    async fn propose_envelope(
        &self,
        envelope: RaftCommandEnvelope,
    ) -> CoordinationResult<CommandResponse>;

    /// Validate, wrap and replicate `command`. A `Failed` response is
    /// turned into an error.
    async fn propose(&self, command: RaftCommand) -> CoordinationResult<CommandResponse> {
        command
            .validate()
            .map_err(CoordinationError::InvalidArgument)?;
        let envelope = RaftCommandEnvelope::wrap(command)?;
        match self.propose_envelope(envelope).await? {
            CommandResponse::Failed { kind, message } => Err(rejected(&kind, message)),
            response => Ok(response),
        }
    }
}

/// Rebuild the caller-facing error for an entry the state machine refused.
fn rejected(kind: &str, message: String) -> CoordinationError {
    match kind {
        "invalid_argument" | "group_mismatch" | "envelope_mismatch" => {
            CoordinationError::InvalidArgument(message)
        }
        "malformed_command" => CoordinationError::MalformedCommand(message),
        _ => CoordinationError::Raft(message),
    }
}

/// Error for a response that does not belong to the proposed command.
pub(crate) fn unexpected(response: CommandResponse) -> CoordinationError {
    CoordinationError::Raft(format!("unexpected state machine response: {response:?}"))
}

/// Applies proposals straight to a local state machine at the next index.
#[cfg(test)]
pub(crate) struct DirectProposer {
    pub(crate) sm: std::sync::Arc<super::state_machine::ClusterStateMachine>,
    next_index: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl DirectProposer {
    pub(crate) fn new(sm: std::sync::Arc<super::state_machine::ClusterStateMachine>) -> Self {
        Self {
            sm,
            next_index: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CommandProposer for DirectProposer {
    async fn propose_envelope(
        &self,
        envelope: RaftCommandEnvelope,
    ) -> CoordinationResult<CommandResponse> {
        let index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let position = super::state_machine::LogPosition::new(1, index);
        match self.sm.apply_envelope(position, &envelope).await {
            Err(e)
                if !matches!(
                    e,
                    CoordinationError::LogGap { .. } | CoordinationError::LogConflict { .. }
                ) =>
            {
                Ok(CommandResponse::Failed {
                    kind: e.as_metric_label().to_string(),
                    message: e.to_string(),
                })
            }
            other => other,
        }
    }
}
