//! Replicated commands, their envelope and the wire codec.
//!
//! Every log entry carries one [`RaftCommandEnvelope`]:
//!
//! ```text
//! {"version": 1, "type": "ASSIGN_KEY", "command": {"groupId": "g1", ...}}
//! ```
//!
//! `type` selects the payload shape on decode and is checked against the
//! payload again after decoding. Commands carry the proposer's
//! `timestampMs` so lease deadlines and `updatedAt` fields come out the same
//! on every replica.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::cluster::assignment::{
    Assignment, DEFAULT_AFFINITY_KIND, KeyAssignment, KeyAssignmentSource, WorkflowHandoff,
};
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::lock::LockRecord;

/// Highest envelope version this build understands.
pub const SUPPORTED_ENVELOPE_VERSION: u32 = 1;

fn default_kind() -> String {
    DEFAULT_AFFINITY_KIND.to_string()
}

/// Discriminator written as the envelope's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    LockAcquire,
    LockRelease,
    AssignPartition,
    RevokePartition,
    AssignKey,
    UnassignKey,
}

impl CommandType {
    pub const ALL: [CommandType; 6] = [
        CommandType::LockAcquire,
        CommandType::LockRelease,
        CommandType::AssignPartition,
        CommandType::RevokePartition,
        CommandType::AssignKey,
        CommandType::UnassignKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::LockAcquire => "LOCK_ACQUIRE",
            CommandType::LockRelease => "LOCK_RELEASE",
            CommandType::AssignPartition => "ASSIGN_PARTITION",
            CommandType::RevokePartition => "REVOKE_PARTITION",
            CommandType::AssignKey => "ASSIGN_KEY",
            CommandType::UnassignKey => "UNASSIGN_KEY",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoordinationError::UnknownCommandType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCommand {
    pub name: String,
    pub owner_node_id: String,
    pub lease_millis: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLockCommand {
    pub name: String,
    pub owner_node_id: String,
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPartitionCommand {
    pub group_id: String,
    pub partition: i32,
    pub owner_node_id: String,
    #[serde(default)]
    pub affinities: BTreeMap<String, Vec<String>>,
    /// Older proposers sent only default-kind values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equipment_ids: Vec<String>,
    #[serde(default)]
    pub workflow_handoff: Option<WorkflowHandoff>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl AssignPartitionCommand {
    /// Unversioned assignment request described by this command.
    pub fn to_assignment(&self) -> Assignment {
        let mut affinities = self.affinities.clone();
        if !self.equipment_ids.is_empty() {
            affinities
                .entry(DEFAULT_AFFINITY_KIND.to_string())
                .or_insert_with(|| self.equipment_ids.clone());
        }
        Assignment {
            group_id: self.group_id.clone(),
            partition: self.partition,
            owner_node_id: self.owner_node_id.clone(),
            affinities,
            workflow_handoff: self.workflow_handoff.clone(),
            version: 0,
            updated_at_ms: self.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokePartitionCommand {
    pub group_id: String,
    pub partition: i32,
    pub reason: String,
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignKeyCommand {
    pub group_id: String,
    pub partition: i32,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub key: String,
    pub app_id: String,
    pub source: KeyAssignmentSource,
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignKeyCommand {
    pub group_id: String,
    pub partition: i32,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub key: String,
    #[serde(default)]
    pub timestamp_ms: u64,
}

/// Every command the state machine can apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftCommand {
    Lock(LockCommand),
    ReleaseLock(ReleaseLockCommand),
    AssignPartition(AssignPartitionCommand),
    RevokePartition(RevokePartitionCommand),
    AssignKey(AssignKeyCommand),
    UnassignKey(UnassignKeyCommand),
}

impl RaftCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            RaftCommand::Lock(_) => CommandType::LockAcquire,
            RaftCommand::ReleaseLock(_) => CommandType::LockRelease,
            RaftCommand::AssignPartition(_) => CommandType::AssignPartition,
            RaftCommand::RevokePartition(_) => CommandType::RevokePartition,
            RaftCommand::AssignKey(_) => CommandType::AssignKey,
            RaftCommand::UnassignKey(_) => CommandType::UnassignKey,
        }
    }

    /// Group an assignment command targets. Lock commands are group-less.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            RaftCommand::Lock(_) | RaftCommand::ReleaseLock(_) => None,
            RaftCommand::AssignPartition(c) => Some(&c.group_id),
            RaftCommand::RevokePartition(c) => Some(&c.group_id),
            RaftCommand::AssignKey(c) => Some(&c.group_id),
            RaftCommand::UnassignKey(c) => Some(&c.group_id),
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            RaftCommand::Lock(c) => c.timestamp_ms,
            RaftCommand::ReleaseLock(c) => c.timestamp_ms,
            RaftCommand::AssignPartition(c) => c.timestamp_ms,
            RaftCommand::RevokePartition(c) => c.timestamp_ms,
            RaftCommand::AssignKey(c) => c.timestamp_ms,
            RaftCommand::UnassignKey(c) => c.timestamp_ms,
        }
    }

    /// Required fields present and lease positive.
    pub fn validate(&self) -> Result<(), String> {
        fn required(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{field} must not be empty"))
            } else {
                Ok(())
            }
        }

        match self {
            RaftCommand::Lock(c) => {
                required("name", &c.name)?;
                required("ownerNodeId", &c.owner_node_id)?;
                if c.lease_millis == 0 {
                    return Err("leaseMillis must be > 0".into());
                }
                Ok(())
            }
            RaftCommand::ReleaseLock(c) => {
                required("name", &c.name)?;
                required("ownerNodeId", &c.owner_node_id)
            }
            RaftCommand::AssignPartition(c) => {
                required("groupId", &c.group_id)?;
                required("ownerNodeId", &c.owner_node_id)
            }
            RaftCommand::RevokePartition(c) => required("groupId", &c.group_id),
            RaftCommand::AssignKey(c) => {
                required("groupId", &c.group_id)?;
                required("kind", &c.kind)?;
                required("key", &c.key)?;
                required("appId", &c.app_id)
            }
            RaftCommand::UnassignKey(c) => {
                required("groupId", &c.group_id)?;
                required("kind", &c.kind)?;
                required("key", &c.key)
            }
        }
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            RaftCommand::Lock(c) => serde_json::to_value(c),
            RaftCommand::ReleaseLock(c) => serde_json::to_value(c),
            RaftCommand::AssignPartition(c) => serde_json::to_value(c),
            RaftCommand::RevokePartition(c) => serde_json::to_value(c),
            RaftCommand::AssignKey(c) => serde_json::to_value(c),
            RaftCommand::UnassignKey(c) => serde_json::to_value(c),
        }
    }

    fn from_payload(command_type: CommandType, payload: Value) -> serde_json::Result<Self> {
        fn parse<T: DeserializeOwned>(payload: Value) -> serde_json::Result<T> {
            serde_json::from_value(payload)
        }

        Ok(match command_type {
            CommandType::LockAcquire => RaftCommand::Lock(parse(payload)?),
            CommandType::LockRelease => RaftCommand::ReleaseLock(parse(payload)?),
            CommandType::AssignPartition => RaftCommand::AssignPartition(parse(payload)?),
            CommandType::RevokePartition => RaftCommand::RevokePartition(parse(payload)?),
            CommandType::AssignKey => RaftCommand::AssignKey(parse(payload)?),
            CommandType::UnassignKey => RaftCommand::UnassignKey(parse(payload)?),
        })
    }
}

/// Versioned, type-tagged wrapper around one command.
///
/// Can only be built with a `command_type` that matches the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftCommandEnvelope {
    version: u32,
    command_type: CommandType,
    command: RaftCommand,
}

impl RaftCommandEnvelope {
    pub fn new(
        version: u32,
        command_type: CommandType,
        command: RaftCommand,
    ) -> CoordinationResult<Self> {
        if version == 0 {
            return Err(CoordinationError::InvalidArgument(
                "envelope version must be > 0".into(),
            ));
        }
        let actual = command.command_type();
        if actual != command_type {
            return Err(CoordinationError::EnvelopeMismatch {
                declared: command_type,
                actual,
            });
        }
        command.validate().map_err(CoordinationError::InvalidArgument)?;
        Ok(Self {
            version,
            command_type,
            command,
        })
    }

    /// Current-version envelope typed from the command itself.
    pub fn wrap(command: RaftCommand) -> CoordinationResult<Self> {
        let command_type = command.command_type();
        Self::new(SUPPORTED_ENVELOPE_VERSION, command_type, command)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn command(&self) -> &RaftCommand {
        &self.command
    }

    pub fn into_command(self) -> RaftCommand {
        self.command
    }

    fn to_wire(&self) -> serde_json::Result<Value> {
        Ok(serde_json::json!({
            "version": self.version,
            "type": self.command_type,
            "command": self.command.payload()?,
        }))
    }
}

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &RaftCommandEnvelope) -> CoordinationResult<Vec<u8>> {
    Ok(serde_json::to_vec(&envelope.to_wire()?)?)
}

/// Parse and validate an envelope.
///
/// Anything that cannot be interpreted unambiguously is an error for the
/// entry; nothing is skipped or guessed.
pub fn decode(bytes: &[u8]) -> CoordinationResult<RaftCommandEnvelope> {
    let wire: Value = serde_json::from_slice(bytes)
        .map_err(|e| CoordinationError::MalformedCommand(format!("invalid JSON: {e}")))?;
    decode_value(wire)
}

fn decode_value(wire: Value) -> CoordinationResult<RaftCommandEnvelope> {
    let Value::Object(mut fields) = wire else {
        return Err(CoordinationError::MalformedCommand(
            "envelope must be a JSON object".into(),
        ));
    };

    let version = match fields.get("version") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| CoordinationError::MalformedCommand(format!("invalid version: {v}")))?,
    };
    if version == 0 {
        return Err(CoordinationError::MalformedCommand(
            "version must be > 0".into(),
        ));
    }

    let command_type: CommandType = match fields.get("type") {
        Some(Value::String(s)) => s.parse()?,
        _ => {
            return Err(CoordinationError::MalformedCommand(
                "missing command type".into(),
            ));
        }
    };

    if version > SUPPORTED_ENVELOPE_VERSION {
        return Err(CoordinationError::UnsupportedEnvelopeVersion(version));
    }

    let payload = match fields.remove("command") {
        Some(Value::Null) | None => {
            return Err(CoordinationError::MalformedCommand(format!(
                "missing command payload for {command_type}"
            )));
        }
        Some(payload) => payload,
    };

    let command = RaftCommand::from_payload(command_type, payload).map_err(|e| {
        CoordinationError::MalformedCommand(format!("invalid {command_type} payload: {e}"))
    })?;
    command.validate().map_err(|e| {
        CoordinationError::MalformedCommand(format!("invalid {command_type} payload: {e}"))
    })?;

    Ok(RaftCommandEnvelope {
        version,
        command_type,
        command,
    })
}

impl Serialize for RaftCommandEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RaftCommandEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = Value::deserialize(deserializer)?;
        decode_value(wire).map_err(serde::de::Error::custom)
    }
}

/// Result of applying one log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Blank or membership entry.
    Ok,
    /// Entry at or below the last applied position; nothing changed.
    Skipped { index: u64 },
    LockAcquired(LockRecord),
    /// Someone else holds the lock.
    LockRejected { name: String, holder: String },
    LockReleased { name: String },
    LockNotHeld { name: String },
    PartitionAssigned(Assignment),
    /// `None` when the partition was not assigned.
    PartitionRevoked(Option<Assignment>),
    KeyAssigned(KeyAssignment),
    KeyUnassigned { removed: bool },
    /// The entry was consumed at its position but could not be applied.
    /// State is unchanged; `kind` is the error's metric label.
    Failed { kind: String, message: String },
}
