//! Node-level configuration.
//!
//! ```rust,no_run
//! use clusterkernel::cluster::ClusterConfig;
//!
//! let config = ClusterConfig::from_env().expect("invalid cluster configuration");
//! if let Err(errors) = config.validate() {
//!     for error in errors {
//!         eprintln!("{error}");
//!     }
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `CLUSTER_NODE_ID`: local node id (default: `node-1`)
//! - `CLUSTER_HOST` / `CLUSTER_PORT`: advertised address (default: `127.0.0.1:7070`)
//! - `CLUSTER_ROLES`: comma separated roles, e.g. `SOURCE,WORKFLOW`
//! - `CLUSTER_ZONE`: availability zone
//! - `CLUSTER_HEARTBEAT_INTERVAL_MS` (default: 5000)
//! - `CLUSTER_HEARTBEAT_TIMEOUT_MS` (default: 15000)
//! - `CLUSTER_LEADER_LEASE_MS` (default: 30000)
//! - `CLUSTER_LOCK_LEASE_MS` (default: 30000)
//! - `CLUSTER_SHUTDOWN_TIMEOUT_MS`: bound for each shutdown step (default: 5000)
//! - `CLUSTER_MODE`: `raft` or `kafka` (default: `raft`). In raft mode the
//!   `RAFT_*` variables are read as well.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::{CoordinationError, CoordinationResult};
use super::leader::LeaderElectionMode;
use super::membership::{ClusterNode, ClusterRole, MembershipConfig};
use super::raft::RaftServerConfig;

/// Configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub host: String,
    pub port: u32,
    pub roles: BTreeSet<ClusterRole>,
    pub zone: Option<String>,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    /// Lease written with each leadership record.
    pub leader_lease: Duration,
    /// Default lease for named locks.
    pub lock_lease: Duration,

    /// Upper bound for each shutdown step.
    pub shutdown_timeout: Duration,

    pub mode: LeaderElectionMode,
    /// Replication settings; present only when the node hosts a state machine.
    pub raft: Option<RaftServerConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let membership = MembershipConfig::default();
        Self {
            node_id: "node-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7070,
            roles: BTreeSet::new(),
            zone: None,
            heartbeat_interval: membership.heartbeat_interval,
            heartbeat_timeout: membership.heartbeat_timeout,
            leader_lease: Duration::from_secs(30),
            lock_lease: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            mode: LeaderElectionMode::Raft,
            raft: None,
        }
    }
}

impl ClusterConfig {
    /// Read overrides from `CLUSTER_*` (and in raft mode `RAFT_*`) variables.
    pub fn from_env() -> CoordinationResult<Self> {
        let defaults = Self::default();

        let port: u32 = env_parse("CLUSTER_PORT", defaults.port)?;
        if !(1..=65535).contains(&port) {
            return Err(CoordinationError::Config(format!(
                "CLUSTER_PORT must be between 1 and 65535, got {port}"
            )));
        }

        let roles = match std::env::var("CLUSTER_ROLES") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(ClusterRole::from_str)
                .collect::<CoordinationResult<BTreeSet<_>>>()?,
            Err(_) => defaults.roles,
        };

        let mode = match std::env::var("CLUSTER_MODE") {
            Ok(raw) => raw
                .parse::<LeaderElectionMode>()
                .map_err(|e| CoordinationError::Config(format!("Invalid CLUSTER_MODE: {e}")))?,
            Err(_) => defaults.mode,
        };

        let raft = match mode {
            LeaderElectionMode::Raft => Some(RaftServerConfig::from_env()?),
            LeaderElectionMode::Kafka => None,
        };

        Ok(Self {
            node_id: std::env::var("CLUSTER_NODE_ID").unwrap_or(defaults.node_id),
            host: std::env::var("CLUSTER_HOST").unwrap_or(defaults.host),
            port,
            roles,
            zone: std::env::var("CLUSTER_ZONE").ok().filter(|z| !z.trim().is_empty()),
            heartbeat_interval: env_millis(
                "CLUSTER_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env_millis("CLUSTER_HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout)?,
            leader_lease: env_millis("CLUSTER_LEADER_LEASE_MS", defaults.leader_lease)?,
            lock_lease: env_millis("CLUSTER_LOCK_LEASE_MS", defaults.lock_lease)?,
            shutdown_timeout: env_millis("CLUSTER_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            mode,
            raft,
        })
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.local_node().validate() {
            errors.push(e.to_string());
        }

        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be positive".to_string());
        }

        if self.heartbeat_interval >= self.heartbeat_timeout {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than heartbeat_timeout ({:?})",
                self.heartbeat_interval, self.heartbeat_timeout
            ));
        }

        if self.leader_lease.is_zero() {
            errors.push("leader_lease must be positive".to_string());
        }

        if self.lock_lease.is_zero() {
            errors.push("lock_lease must be positive".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            errors.push("shutdown_timeout must be positive".to_string());
        }

        if let Some(raft) = &self.raft {
            if let Err(raft_errors) = raft.validate() {
                errors.extend(raft_errors.into_iter().map(|e| format!("raft: {e}")));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Identity advertised by this node.
    pub fn local_node(&self) -> ClusterNode {
        let node = ClusterNode::new(self.node_id.clone(), self.host.clone(), self.port)
            .with_roles(self.roles.iter().copied());
        match &self.zone {
            Some(zone) => node.with_zone(zone.clone()),
            None => node,
        }
    }

    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

pub(crate) fn env_parse<T>(name: &str, default: T) -> CoordinationResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoordinationError::Config(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_millis(name: &str, default: Duration) -> CoordinationResult<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}
