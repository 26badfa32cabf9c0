//! Type definitions for the Raft consensus layer.

use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::commands::{CommandResponse, RaftCommandEnvelope};

/// Node ID type for Raft nodes.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = RaftCommandEnvelope,
        R = CommandResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// A voter in a replicated group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RaftNodeInfo {
    /// The node's Raft ID.
    pub raft_id: RaftNodeId,
    /// Address the transport dials for this node.
    pub raft_addr: String,
    /// Membership node id of the same process, used as the leader id.
    pub cluster_node_id: String,
}

impl RaftNodeInfo {
    pub fn new(
        raft_id: RaftNodeId,
        raft_addr: impl Into<String>,
        cluster_node_id: impl Into<String>,
    ) -> Self {
        Self {
            raft_id,
            raft_addr: raft_addr.into(),
            cluster_node_id: cluster_node_id.into(),
        }
    }

    pub fn basic_node(&self) -> BasicNode {
        BasicNode::new(self.raft_addr.clone())
    }
}
