//! Cluster coordination.
//!
//! Gives a set of worker nodes one consistent view of who is alive, who
//! owns which partition or key, who leads each group and who holds which
//! named lock. The view is backed either by a coordination store (with
//! compare-and-set and TTLs) or by a Raft-replicated state machine.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │      ClusterNodeRuntime      │
//!                └──┬─────────┬─────────┬───────┘
//!                   │         │         │
//!           ┌───────▼──┐ ┌────▼────┐ ┌──▼────────────┐
//!           │Membership│ │ Leader  │ │ Locks         │
//!           │+ monitor │ │election │ │               │
//!           └───────┬──┘ └────┬────┘ └──┬────────────┘
//!                   └─────────┼─────────┘
//!                             ▼
//!                   ┌────────────────────┐        ┌──────────────────────┐
//!                   │ CoordinationStore  │        │ raft::ClusterState-  │
//!                   │ (TTL, CAS, watch)  │        │ Machine (replicated) │
//!                   └────────────────────┘        └──────────────────────┘
//! ```
//!
//! Key layout in the store:
//!
//! | Key | Owner |
//! |-----|-------|
//! | `cluster:nodes/{nodeId}` | [`MembershipService`] |
//! | `cluster:leader/{groupId}` | [`CasLeaderElectionService`] |
//! | `cluster:raft/leader/{groupId}` | [`CasLeaderElectionService`] in raft mode |
//! | `cluster:locks/{name}` | [`StoreLockService`] |
//! | `cluster:raft/snapshots/{groupId}` | [`raft::StoreSnapshotStore`] |
//!
//! Lost races are never errors: they come back as `Ok(false)` or `Ok(None)`.

pub mod assignment;
pub mod background_tasks;
pub mod clock;
mod config;
mod error;
pub mod leader;
pub mod lock;
pub mod membership;
pub mod metrics;
pub mod raft;
pub mod retry;
mod runtime;
pub mod store;

pub use assignment::{
    AffinityKeyExtractor, Assignment, AssignmentService, AssignmentServiceExt,
    DEFAULT_AFFINITY_KIND, InMemoryAssignmentService, KeyAssignment, KeyAssignmentSource,
    TopologyEvent, TopologyEventType, WorkflowHandoff,
};
pub use background_tasks::{BackgroundTaskRegistry, ShutdownReport, TaskStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClusterConfig;
pub use error::{CoordinationError, CoordinationResult};
pub use leader::{
    CasLeaderElectionService, KafkaLeaderElectionService, LeaderElectionMode,
    LeaderElectionService, LeaderInfo,
};
pub use lock::{DistributedLockService, LockRecord, StoreLockService};
pub use membership::{
    ClusterNode, ClusterRole, HeartbeatMonitor, MembershipConfig, MembershipEvent,
    MembershipEventType, MembershipService, NodeRecord, NodeStatus,
};
pub use runtime::ClusterNodeRuntime;
pub use store::{CoordinationStore, InMemoryCoordinationStore, StoreEvent, StoreEventKind, TypedStoreExt};
