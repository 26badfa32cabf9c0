//! Replicated coordination state.
//!
//! Each coordination group owns one [`ClusterStateMachine`] holding its
//! locks, partition assignments and key assignments. Changes are proposed
//! as [`RaftCommand`]s, replicated by openraft and applied on every replica
//! in log order.
//!
//! # Architecture
//!
//! ```text
//!   RaftAssignmentService ─┐                      ┌──────────────────────┐
//!   RaftLockService ───────┼─► CommandProposer ──►│ RaftNode (openraft)  │
//!                          │     (RaftNode)       │   RaftStore          │
//!                          │                      │     └► ClusterStateMachine ──► SnapshotStore
//!   reads ─────────────────┴──────────────────────┴──────────┘
//! ```
//!
//! Guards layered on top:
//!
//! - [`RebalanceSafeModeGuard`] stops all processing during a rebalance.
//! - [`LeaderProcessingGuard`] allows processing only on the group leader.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clusterkernel::cluster::raft::{
//!     ClusterStateMachine, FileSnapshotStore, InProcessRouter, RaftNode, RaftNodeInfo,
//!     RaftServerConfig,
//! };
//!
//! # async fn run() -> Result<(), clusterkernel::cluster::CoordinationError> {
//! let config = RaftServerConfig::from_env()?;
//! let snapshots = Arc::new(FileSnapshotStore::new(config.data_dir.join("snapshots")));
//! let sm = Arc::new(ClusterStateMachine::for_config("orders", &config, snapshots));
//! sm.start().await?;
//!
//! let router = InProcessRouter::new();
//! let node = RaftNode::start(&config, RaftNodeInfo::new(1, "local", "node-1"), router.factory(1), sm).await?;
//! router.register(1, node.raft());
//! node.initialize(&[]).await?;
//! # Ok(())
//! # }
//! ```

mod assignment;
mod commands;
mod config;
pub mod domains;
mod health;
mod lock;
mod network;
mod node;
mod processing_guard;
mod proposer;
mod safe_mode;
mod snapshot;
mod state_machine;
mod storage;
mod types;

pub use assignment::RaftAssignmentService;
pub use commands::{
    AssignKeyCommand, AssignPartitionCommand, CommandResponse, CommandType, LockCommand,
    RaftCommand, RaftCommandEnvelope, ReleaseLockCommand, RevokePartitionCommand,
    SUPPORTED_ENVELOPE_VERSION, UnassignKeyCommand, decode, encode,
};
pub use config::{RaftGroupConfig, RaftServerConfig, SnapshotStoreKind};
pub use health::{DEFAULT_STALENESS, RaftHealthSnapshot, StateMachineMetrics};
pub use lock::RaftLockService;
pub use network::{InProcessNetwork, InProcessRouter};
pub use node::{DEFAULT_MAX_PENDING_PROPOSALS, RaftLeaderView, RaftNode};
pub use processing_guard::LeaderProcessingGuard;
pub use proposer::CommandProposer;
pub use safe_mode::{ProcessingDecision, RebalanceSafeModeGuard};
pub use snapshot::{
    ClusterSnapshot, FileSnapshotStore, ObjectStoreSnapshotStore, SNAPSHOT_FORMAT_VERSION,
    SNAPSHOT_KEY_PREFIX, SnapshotStore, StoreSnapshotStore, normalize_legacy,
    snapshot_store_for_config,
};
pub use state_machine::{ClusterStateMachine, LogPosition};
pub use storage::RaftStore;
pub use types::{RaftNodeId, RaftNodeInfo, TypeConfig};
