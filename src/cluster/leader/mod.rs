//! Per-group leader election.
//!
//! Every backend answers the same questions with the same [`LeaderInfo`]
//! shape:
//!
//! - [`CasLeaderElectionService`]: compare-and-set over the coordination store.
//! - [`KafkaLeaderElectionService`]: local bookkeeping for consumer-group
//!   ownership that Kafka already elected.
//! - `RaftLeaderView` (in `raft::node`): read-only view of the consensus
//!   engine's leader.
//!
//! A record is authoritative only while `now < lease_expires_at_ms`. Callers
//! re-check on every read; nothing is trusted from a cached copy.

mod cas;
mod kafka;

pub use cas::{CasLeaderElectionService, LEADER_PREFIX, RAFT_LEADER_PREFIX};
pub use kafka::KafkaLeaderElectionService;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::error::{CoordinationError, CoordinationResult};

/// How leadership for a group is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderElectionMode {
    #[default]
    Raft,
    Kafka,
}

impl LeaderElectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderElectionMode::Raft => "RAFT",
            LeaderElectionMode::Kafka => "KAFKA",
        }
    }
}

impl fmt::Display for LeaderElectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaderElectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raft" => Ok(LeaderElectionMode::Raft),
            "kafka" => Ok(LeaderElectionMode::Kafka),
            other => Err(format!(
                "Invalid leader election mode '{}', expected 'raft' or 'kafka'",
                other
            )),
        }
    }
}

/// Leadership record for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub group_id: String,
    pub leader_node_id: String,
    pub mode: LeaderElectionMode,
    pub term: u64,
    pub elected_at_ms: u64,
    pub lease_expires_at_ms: u64,
}

impl LeaderInfo {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.lease_expires_at_ms
    }

    pub fn is_held_by(&self, node_id: &str) -> bool {
        self.leader_node_id == node_id
    }
}

/// Stream of successful leader (re-)acquisitions for one group.
pub struct LeaderWatcher {
    group_id: String,
    inner: BoxStream<'static, LeaderInfo>,
}

impl LeaderWatcher {
    pub fn new(group_id: impl Into<String>, inner: BoxStream<'static, LeaderInfo>) -> Self {
        Self {
            group_id: group_id.into(),
            inner,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Next acquisition, or `None` once the source is closed.
    pub async fn recv(&mut self) -> Option<LeaderInfo> {
        self.inner.next().await
    }
}

/// Leader election for named groups.
///
/// Losing a race is not an error: `try_acquire_leader` returns `Ok(None)`.
#[async_trait]
pub trait LeaderElectionService: Send + Sync {
    /// Backend mode this service implements.
    fn mode(&self) -> LeaderElectionMode;

    /// Try to become (or stay) leader of `group_id` for `lease`.
    async fn try_acquire_leader(
        &self,
        group_id: &str,
        node_id: &str,
        mode: LeaderElectionMode,
        lease: Duration,
    ) -> CoordinationResult<Option<LeaderInfo>>;

    /// Give up leadership. Only the recorded owner can release.
    async fn release(&self, group_id: &str, node_id: &str) -> CoordinationResult<bool>;

    /// Current unexpired leader, if any.
    async fn get_leader(&self, group_id: &str) -> CoordinationResult<Option<LeaderInfo>>;

    fn watch(&self, group_id: &str) -> LeaderWatcher;
}

pub(crate) fn validate_acquire(
    group_id: &str,
    node_id: &str,
    lease: Duration,
) -> CoordinationResult<()> {
    if group_id.trim().is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "groupId must not be empty".into(),
        ));
    }
    if node_id.trim().is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "nodeId must not be empty".into(),
        ));
    }
    if lease.is_zero() {
        return Err(CoordinationError::InvalidArgument(
            "lease duration must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("raft".parse::<LeaderElectionMode>().unwrap(), LeaderElectionMode::Raft);
        assert_eq!(" KAFKA ".parse::<LeaderElectionMode>().unwrap(), LeaderElectionMode::Kafka);
        assert!("zookeeper".parse::<LeaderElectionMode>().is_err());
        assert_eq!(LeaderElectionMode::Kafka.to_string(), "KAFKA");
    }

    #[test]
    fn test_leader_info_expiry_boundary() {
        let info = LeaderInfo {
            group_id: "g1".into(),
            leader_node_id: "node-1".into(),
            mode: LeaderElectionMode::Raft,
            term: 1,
            elected_at_ms: 0,
            lease_expires_at_ms: 1_000,
        };
        assert!(!info.is_expired(999));
        assert!(info.is_expired(1_000));
        assert!(info.is_held_by("node-1"));
    }

    #[test]
    fn test_leader_info_wire_shape() {
        let info = LeaderInfo {
            group_id: "g1".into(),
            leader_node_id: "node-1".into(),
            mode: LeaderElectionMode::Kafka,
            term: 3,
            elected_at_ms: 5,
            lease_expires_at_ms: 10,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["leaderNodeId"], "node-1");
        assert_eq!(json["mode"], "KAFKA");
        assert_eq!(json["leaseExpiresAtMs"], 10);
    }

    #[test]
    fn test_validate_acquire() {
        assert!(validate_acquire("g", "n", Duration::from_secs(1)).is_ok());
        assert!(validate_acquire("", "n", Duration::from_secs(1)).is_err());
        assert!(validate_acquire("g", " ", Duration::from_secs(1)).is_err());
        assert!(validate_acquire("g", "n", Duration::ZERO).is_err());
    }
}
