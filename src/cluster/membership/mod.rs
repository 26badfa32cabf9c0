//! Heartbeat-driven membership.
//!
//! Each node owns one record under `cluster:nodes/{nodeId}`:
//!
//! ```text
//!   join ──► UP ──(now ≥ last + timeout)──► SUSPECT ──(now ≥ last + 2×timeout)──► DOWN
//!             ▲                                │                                   │
//!             └────────────── heartbeat ───────┴───────────────────────────────────┘
//!
//!   leave: any ──► LEFT (never changed by timeout detection)
//!   remove: record erased
//! ```
//!
//! Records are written with TTL `2×timeout + interval` so a node that
//! disappears without leaving eventually drops out of the store on its own.
//! Timeout detection writes with compare-and-set so it never overwrites a
//! heartbeat that landed after it read the record.

mod monitor;

pub use monitor::HeartbeatMonitor;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::error::{CoordinationError, CoordinationResult};
use super::metrics;
use super::store::{CoordinationStore, TypedStoreExt};

/// Key prefix for node records.
pub const NODES_PREFIX: &str = "cluster:nodes/";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Role a node plays in the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    Source,
    Handler,
    Pipeline,
    Sink,
    Workflow,
}

impl std::str::FromStr for ClusterRole {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOURCE" => Ok(ClusterRole::Source),
            "HANDLER" => Ok(ClusterRole::Handler),
            "PIPELINE" => Ok(ClusterRole::Pipeline),
            "SINK" => Ok(ClusterRole::Sink),
            "WORKFLOW" => Ok(ClusterRole::Workflow),
            other => Err(CoordinationError::Config(format!(
                "unknown cluster role '{other}'"
            ))),
        }
    }
}

/// Immutable identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: String,
    pub host: String,
    pub port: u32,
    #[serde(default)]
    pub roles: BTreeSet<ClusterRole>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ClusterNode {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            roles: BTreeSet::new(),
            zone: None,
            metadata: BTreeMap::new(),
            version: None,
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = ClusterRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "nodeId must not be empty".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "host must not be empty".into(),
            ));
        }
        if self.port == 0 || self.port > 65535 {
            return Err(CoordinationError::InvalidArgument(format!(
                "port ({}) must be between 1 and 65535",
                self.port
            )));
        }
        Ok(())
    }
}

/// Liveness status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Joining,
    Up,
    Suspect,
    Down,
    Left,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Joining => "JOINING",
            NodeStatus::Up => "UP",
            NodeStatus::Suspect => "SUSPECT",
            NodeStatus::Down => "DOWN",
            NodeStatus::Left => "LEFT",
        };
        f.write_str(s)
    }
}

/// A node plus its liveness bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node: ClusterNode,
    pub status: NodeStatus,
    pub joined_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl NodeRecord {
    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    fn with_status(&self, status: NodeStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipEventType {
    Joined,
    Heartbeat,
    Suspected,
    Down,
    Left,
    Removed,
    Updated,
}

impl MembershipEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipEventType::Joined => "JOINED",
            MembershipEventType::Heartbeat => "HEARTBEAT",
            MembershipEventType::Suspected => "SUSPECTED",
            MembershipEventType::Down => "DOWN",
            MembershipEventType::Left => "LEFT",
            MembershipEventType::Removed => "REMOVED",
            MembershipEventType::Updated => "UPDATED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    pub event_type: MembershipEventType,
    pub node: NodeRecord,
    pub emitted_at_ms: u64,
}

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipConfig {
    /// How often each node heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which a node is SUSPECT; DOWN after twice this.
    pub heartbeat_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

impl MembershipConfig {
    /// TTL for live node records.
    pub fn record_ttl(&self) -> Duration {
        self.heartbeat_timeout * 2 + self.heartbeat_interval
    }

    /// How often timeout detection should run.
    pub fn detection_interval(&self) -> Duration {
        (self.heartbeat_timeout / 2).max(Duration::from_millis(1))
    }
}

/// Store-backed membership service.
pub struct MembershipService {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    config: MembershipConfig,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: MembershipConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            clock,
            config,
            events,
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Subscribe to membership events.
    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Register `node` as UP.
    pub async fn join(&self, node: ClusterNode) -> CoordinationResult<NodeRecord> {
        node.validate()?;
        let now = self.clock.now_ms();
        let record = NodeRecord {
            node,
            status: NodeStatus::Up,
            joined_at_ms: now,
            last_heartbeat_ms: now,
        };
        self.store
            .put_as(&node_key(record.node_id()), &record, self.config.record_ttl())
            .await?;

        info!(node_id = %record.node_id(), host = %record.node.host, port = record.node.port, "Node joined cluster");
        self.emit(MembershipEventType::Joined, record.clone(), now);
        Ok(record)
    }

    /// Refresh `node_id`'s heartbeat. A LEFT node stays LEFT.
    pub async fn heartbeat(&self, node_id: &str) -> CoordinationResult<NodeRecord> {
        let current = self
            .find_node(node_id)
            .await?
            .ok_or_else(|| CoordinationError::UnknownNode(node_id.to_string()))?;

        let now = self.clock.now_ms();
        let status = if current.status == NodeStatus::Left {
            NodeStatus::Left
        } else {
            NodeStatus::Up
        };
        if matches!(current.status, NodeStatus::Suspect | NodeStatus::Down) {
            info!(node_id, previous = %current.status, "Node recovered on heartbeat");
        }

        let record = NodeRecord {
            status,
            last_heartbeat_ms: now,
            ..current
        };
        self.store
            .put_as(&node_key(node_id), &record, self.config.record_ttl())
            .await?;

        debug!(node_id, status = %record.status, "Heartbeat recorded");
        self.emit(MembershipEventType::Heartbeat, record.clone(), now);
        Ok(record)
    }

    /// Mark `node_id` LEFT. The record then expires after one heartbeat timeout.
    pub async fn leave(&self, node_id: &str) -> CoordinationResult<()> {
        let Some(current) = self.find_node(node_id).await? else {
            debug!(node_id, "Leave for unknown node ignored");
            return Ok(());
        };

        let now = self.clock.now_ms();
        let record = current.with_status(NodeStatus::Left);
        self.store
            .put_as(&node_key(node_id), &record, self.config.heartbeat_timeout)
            .await?;

        info!(node_id, "Node left cluster");
        self.emit(MembershipEventType::Left, record, now);
        Ok(())
    }

    /// Erase `node_id`'s record.
    pub async fn remove(&self, node_id: &str) -> CoordinationResult<()> {
        let current = self.find_node(node_id).await?;
        self.store.delete(&node_key(node_id)).await?;

        if let Some(record) = current {
            info!(node_id, "Node removed from cluster");
            self.emit(MembershipEventType::Removed, record, self.clock.now_ms());
        }
        Ok(())
    }

    /// Replace a node's descriptor (roles, zone, metadata) keeping its status.
    pub async fn update_node(&self, node: ClusterNode) -> CoordinationResult<NodeRecord> {
        node.validate()?;
        let current = self
            .find_node(&node.node_id)
            .await?
            .ok_or_else(|| CoordinationError::UnknownNode(node.node_id.clone()))?;

        let record = NodeRecord { node, ..current };
        let ttl = if record.status == NodeStatus::Left {
            self.config.heartbeat_timeout
        } else {
            self.config.record_ttl()
        };
        self.store
            .put_as(&node_key(record.node_id()), &record, ttl)
            .await?;

        self.emit(MembershipEventType::Updated, record.clone(), self.clock.now_ms());
        Ok(record)
    }

    pub async fn find_node(&self, node_id: &str) -> CoordinationResult<Option<NodeRecord>> {
        self.store.get_as(&node_key(node_id)).await
    }

    /// Current membership view keyed by node id.
    pub async fn view(&self) -> CoordinationResult<BTreeMap<String, NodeRecord>> {
        let records = self.store.scan_as::<NodeRecord>(NODES_PREFIX).await?;
        Ok(records
            .into_iter()
            .map(|(_, r)| (r.node.node_id.clone(), r))
            .collect())
    }

    /// Demote silent nodes. Idempotent; LEFT nodes are never touched.
    ///
    /// Returns the events emitted by this pass.
    pub async fn detect_timeouts(&self) -> CoordinationResult<Vec<MembershipEvent>> {
        let now = self.clock.now_ms();
        let timeout = self.config.heartbeat_timeout.as_millis() as u64;
        let mut emitted = Vec::new();

        for (_, record) in self.store.scan_as::<NodeRecord>(NODES_PREFIX).await? {
            let Some((next, event_type)) = next_status(&record, now, timeout) else {
                continue;
            };

            let updated = record.with_status(next);
            let swapped = self
                .store
                .compare_and_set_as(
                    &node_key(record.node_id()),
                    &record,
                    &updated,
                    self.remaining_ttl(&record, now),
                )
                .await?;
            if !swapped {
                debug!(node_id = %record.node_id(), "Record changed during detection, skipping");
                continue;
            }

            warn!(
                node_id = %record.node_id(),
                from = %record.status,
                to = %next,
                silent_ms = now.saturating_sub(record.last_heartbeat_ms),
                "Node heartbeat timeout"
            );
            let event = MembershipEvent {
                event_type,
                node: updated,
                emitted_at_ms: now,
            };
            self.publish(event.clone());
            emitted.push(event);
        }
        Ok(emitted)
    }

    /// Status changes keep the expiry set by the last heartbeat.
    fn remaining_ttl(&self, record: &NodeRecord, now: u64) -> Duration {
        let expires_at = record
            .last_heartbeat_ms
            .saturating_add(self.config.record_ttl().as_millis() as u64);
        Duration::from_millis(expires_at.saturating_sub(now).max(1))
    }

    fn emit(&self, event_type: MembershipEventType, node: NodeRecord, now: u64) {
        self.publish(MembershipEvent {
            event_type,
            node,
            emitted_at_ms: now,
        });
    }

    fn publish(&self, event: MembershipEvent) {
        metrics::record_membership_event(event.event_type.as_str());
        let _ = self.events.send(event);
    }
}

fn node_key(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}")
}

/// Timeout transition for `record` at `now`, if any.
fn next_status(
    record: &NodeRecord,
    now: u64,
    timeout_ms: u64,
) -> Option<(NodeStatus, MembershipEventType)> {
    if record.status == NodeStatus::Left {
        return None;
    }
    let last = record.last_heartbeat_ms;
    if now >= last.saturating_add(timeout_ms.saturating_mul(2)) {
        if record.status != NodeStatus::Down {
            return Some((NodeStatus::Down, MembershipEventType::Down));
        }
        return None;
    }
    if now >= last.saturating_add(timeout_ms) && record.status == NodeStatus::Up {
        return Some((NodeStatus::Suspect, MembershipEventType::Suspected));
    }
    None
}
