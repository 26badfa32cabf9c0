//! Error types for the coordination kernel.
//!
//! # Error Handling Patterns
//!
//! Failures fall into four groups and each is handled differently:
//!
//! ## Contention (never an error)
//!
//! Losing a compare-and-set race, finding a lock held by another node or a
//! leader lease owned elsewhere is an expected outcome. These surface as
//! `Ok(false)` / `Ok(None)` and callers back off or retry.
//!
//! ## Caller Misuse (fail fast)
//!
//! Missing fields, unknown nodes, envelope/command type mismatches. Rejected
//! before anything is written:
//!
//! ```text
//! let envelope = RaftCommandEnvelope::new(1, CommandType::AssignKey, lock_cmd)?;
//! // => Err(CoordinationError::EnvelopeMismatch { .. })
//! ```
//!
//! ## I/O Faults (propagate)
//!
//! Store and snapshot persistence failures are returned to the caller. The
//! state machine never advances its snapshot bookkeeping on a failed write.
//!
//! ## Consistency Faults (fatal for the entry)
//!
//! Log entries with unknown command types, undecodable payloads or index
//! gaps. The node must not guess an interpretation; the error propagates to
//! the consensus layer which halts application.
//!
//! ## Guidelines
//!
//! - **Write path**: always fail-fast
//! - **Background loops**: best-effort with logging
//! - **Shutdown**: bounded, best-effort per step

use thiserror::Error;

use super::raft::CommandType;

/// Result type for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors raised by the coordination kernel.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A required argument was missing or out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Heartbeat or lookup for a node that never joined.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Envelope declared one command type but carried another.
    #[error("Command type mismatch: envelope declares {declared}, command is {actual}")]
    EnvelopeMismatch {
        declared: CommandType,
        actual: CommandType,
    },

    /// Assignment command addressed to a different replicated group.
    #[error("Command for group {command_group} applied to state machine of group {machine_group}")]
    GroupMismatch {
        machine_group: String,
        command_group: String,
    },

    /// Backing coordination store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store failure.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Snapshot could not be persisted or loaded.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Log entry carried a command type this node does not know.
    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    /// Log entry payload could not be decoded into its declared shape.
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// Envelope version is newer than this node understands.
    #[error("Unsupported envelope version {0}")]
    UnsupportedEnvelopeVersion(u32),

    /// Entries must be applied strictly in index order.
    #[error("Log gap: expected index {expected}, got {found}")]
    LogGap { expected: u64, found: u64 },

    /// An entry at or below the applied index carries a newer term, so the
    /// log was rewritten underneath the applied state.
    #[error("Log conflict: entry ({term}, {index}) is behind applied ({applied_term}, {applied_index})")]
    LogConflict {
        term: u64,
        index: u64,
        applied_term: u64,
        applied_index: u64,
    },

    /// Proposal reached a node that is not the leader.
    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    /// Consensus engine failure.
    #[error("Raft error: {0}")]
    Raft(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded shutdown step did not finish in time.
    #[error("Shutdown step '{0}' timed out")]
    ShutdownTimeout(&'static str),
}

impl CoordinationError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only transient I/O and leadership faults are retriable. Misuse and
    /// consistency faults will fail the same way every time.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Store(_)
                | CoordinationError::Io(_)
                | CoordinationError::ObjectStore(_)
                | CoordinationError::NotLeader { .. }
                | CoordinationError::Raft(_)
        )
    }

    /// Whether this error indicates the replicated log cannot be trusted
    /// at the failing entry.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(
            self,
            CoordinationError::UnknownCommandType(_)
                | CoordinationError::MalformedCommand(_)
                | CoordinationError::UnsupportedEnvelopeVersion(_)
                | CoordinationError::LogGap { .. }
                | CoordinationError::LogConflict { .. }
                | CoordinationError::GroupMismatch { .. }
        )
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            CoordinationError::InvalidArgument(_) => "invalid_argument",
            CoordinationError::UnknownNode(_) => "unknown_node",
            CoordinationError::EnvelopeMismatch { .. } => "envelope_mismatch",
            CoordinationError::GroupMismatch { .. } => "group_mismatch",
            CoordinationError::Store(_) => "store",
            CoordinationError::Io(_) => "io",
            CoordinationError::ObjectStore(_) => "object_store",
            CoordinationError::Snapshot(_) => "snapshot",
            CoordinationError::Serialization(_) => "serialization",
            CoordinationError::UnknownCommandType(_) => "unknown_command_type",
            CoordinationError::MalformedCommand(_) => "malformed_command",
            CoordinationError::UnsupportedEnvelopeVersion(_) => "unsupported_version",
            CoordinationError::LogGap { .. } => "log_gap",
            CoordinationError::LogConflict { .. } => "log_conflict",
            CoordinationError::NotLeader { .. } => "not_leader",
            CoordinationError::Raft(_) => "raft",
            CoordinationError::Config(_) => "config",
            CoordinationError::ShutdownTimeout(_) => "shutdown_timeout",
        }
    }
}
