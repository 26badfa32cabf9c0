//! Configuration for the replicated state machine and its consensus node.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::config::{env_millis, env_parse};
use crate::cluster::error::{CoordinationError, CoordinationResult};

/// Where snapshots are persisted.
///
/// `db`, `repository` and `kafka-ktable` name external backends that are
/// all served through the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotStoreKind {
    #[default]
    File,
    Db,
    Repository,
    KafkaKtable,
    ObjectStore,
}

impl SnapshotStoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Db => "db",
            Self::Repository => "repository",
            Self::KafkaKtable => "kafka-ktable",
            Self::ObjectStore => "object-store",
        }
    }
}

impl fmt::Display for SnapshotStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStoreKind {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "file" => Ok(Self::File),
            "db" => Ok(Self::Db),
            "repository" => Ok(Self::Repository),
            "kafka-ktable" => Ok(Self::KafkaKtable),
            "object-store" | "objectstore" => Ok(Self::ObjectStore),
            other => Err(CoordinationError::Config(format!(
                "unknown snapshot store '{other}'"
            ))),
        }
    }
}

/// Peers of one replicated group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftGroupConfig {
    pub group_id: String,
    pub peers: BTreeSet<String>,
}

impl RaftGroupConfig {
    pub fn new(group_id: impl Into<String>, peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            group_id: group_id.into(),
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }

    /// Union of both peer sets. `other`'s group id wins when non-empty.
    pub fn merge(&self, other: &RaftGroupConfig) -> RaftGroupConfig {
        let group_id = if other.group_id.is_empty() {
            self.group_id.clone()
        } else {
            other.group_id.clone()
        };
        RaftGroupConfig {
            group_id,
            peers: self.peers.union(&other.peers).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaftServerConfig {
    /// Consensus id of this node.
    pub node_id: u64,

    pub data_dir: PathBuf,

    /// Voters per group. Only 3 or 5.
    pub peer_count: u32,

    pub heartbeat_interval: Duration,

    pub rpc_timeout: Duration,

    pub election_timeout_min: Duration,

    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Snapshot after this many applied commands. Zero disables.
    pub snapshot_threshold: u64,

    pub snapshot_size_threshold_bytes: u64,

    pub snapshot_store: SnapshotStoreKind,

    /// Path prefix used by the object-store snapshot backend.
    pub snapshot_prefix: String,

    pub groups: BTreeMap<String, RaftGroupConfig>,
}

impl Default for RaftServerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: PathBuf::from("data/raft"),
            peer_count: 3,
            heartbeat_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(5),
            election_timeout_min: Duration::from_millis(1_500),
            election_timeout_max: Duration::from_millis(3_000),
            max_payload_entries: 300,
            snapshot_threshold: 1_000,
            snapshot_size_threshold_bytes: 64 * 1024 * 1024,
            snapshot_store: SnapshotStoreKind::File,
            snapshot_prefix: "raft/snapshots".to_string(),
            groups: BTreeMap::new(),
        }
    }
}

/// Parse `group=peer;peer,group=peer;peer`.
fn parse_groups(raw: &str) -> CoordinationResult<BTreeMap<String, RaftGroupConfig>> {
    let mut groups = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((group_id, peers)) = entry.split_once('=') else {
            return Err(CoordinationError::Config(format!(
                "Invalid RAFT_GROUPS entry '{entry}', expected group=peer;peer"
            )));
        };
        let group_id = group_id.trim();
        let config = RaftGroupConfig::new(
            group_id,
            peers.split(';').map(str::trim).filter(|p| !p.is_empty()),
        );
        groups
            .entry(group_id.to_string())
            .and_modify(|existing: &mut RaftGroupConfig| *existing = existing.merge(&config))
            .or_insert(config);
    }
    Ok(groups)
}

impl RaftServerConfig {
    /// Read overrides from `RAFT_*` environment variables.
    pub fn from_env() -> CoordinationResult<Self> {
        let defaults = Self::default();

        let snapshot_store = match std::env::var("RAFT_SNAPSHOT_STORE") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.snapshot_store,
        };
        let groups = match std::env::var("RAFT_GROUPS") {
            Ok(raw) => parse_groups(&raw)?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            node_id: env_parse("RAFT_NODE_ID", defaults.node_id)?,
            data_dir: std::env::var("RAFT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            peer_count: env_parse("RAFT_PEER_COUNT", defaults.peer_count)?,
            heartbeat_interval: env_millis("RAFT_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            rpc_timeout: env_millis("RAFT_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
            election_timeout_min: env_millis(
                "RAFT_ELECTION_TIMEOUT_MIN_MS",
                defaults.election_timeout_min,
            )?,
            election_timeout_max: env_millis(
                "RAFT_ELECTION_TIMEOUT_MAX_MS",
                defaults.election_timeout_max,
            )?,
            snapshot_threshold: env_parse("RAFT_SNAPSHOT_THRESHOLD", defaults.snapshot_threshold)?,
            snapshot_size_threshold_bytes: env_parse(
                "RAFT_SNAPSHOT_SIZE_THRESHOLD_BYTES",
                defaults.snapshot_size_threshold_bytes,
            )?,
            snapshot_store,
            snapshot_prefix: std::env::var("RAFT_SNAPSHOT_PREFIX")
                .unwrap_or(defaults.snapshot_prefix),
            groups,
            ..defaults
        })
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.peer_count != 3 && self.peer_count != 5 {
            errors.push(format!("peer_count ({}) must be 3 or 5", self.peer_count));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.rpc_timeout.is_zero() {
            errors.push("rpc_timeout must be positive".to_string());
        }

        if self.max_payload_entries == 0 {
            errors.push("max_payload_entries must be positive".to_string());
        }

        for (name, group) in &self.groups {
            if group.group_id.is_empty() {
                errors.push(format!("group '{name}' has an empty group_id"));
            }
            if !group.peers.is_empty() && group.peers.len() != self.peer_count as usize {
                errors.push(format!(
                    "group '{name}' lists {} peers, expected {}",
                    group.peers.len(),
                    self.peer_count
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build the consensus engine configuration for `group_id`.
    pub fn to_openraft_config(&self, group_id: &str) -> openraft::Config {
        let snapshot_policy = if self.snapshot_threshold == 0 {
            openraft::SnapshotPolicy::Never
        } else {
            openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold)
        };
        openraft::Config {
            cluster_name: format!("clusterkernel-{group_id}"),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            install_snapshot_timeout: self.rpc_timeout.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy,
            ..Default::default()
        }
    }
}
