//! # clusterkernel
//! Cluster coordination kernel for groups of worker nodes.
//!
//! This crate gives a set of nodes a consistent, fault-tolerant view of:
//! - who is alive (heartbeat membership with SUSPECT/DOWN staging)
//! - who owns which partition and affinity key (versioned assignments)
//! - who leads each group (CAS + lease election, or Kafka-assigned)
//! - who holds which named lock (lease locks with lazy expiry)
//!
//! The view is backed either by a [`CoordinationStore`](cluster::CoordinationStore)
//! or by a Raft-replicated state machine ([`cluster::raft`]) built on
//! [openraft](https://docs.rs/openraft).
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use clusterkernel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     clusterkernel::telemetry::init_logging(clusterkernel::telemetry::LogFormat::from_env())?;
//!
//!     let clock = Arc::new(SystemClock);
//!     let store = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
//!     let runtime = ClusterNodeRuntime::new(ClusterConfig::from_env()?, store, clock)?;
//!     runtime.start().await?;
//!
//!     if runtime.acquire_lock("compaction", BTreeMap::new()).await?.is_some() {
//!         // this node compacts
//!     }
//!
//!     let guard = runtime.processing_guard("orders");
//!     if guard.allow_processing().await?.is_allowed() {
//!         // leader-affine work
//!     }
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod telemetry;

pub mod prelude {
    //! Common imports.
    pub use crate::cluster::raft::{
        ClusterStateMachine, CommandProposer, LeaderProcessingGuard, ProcessingDecision,
        RaftAssignmentService, RaftLockService, RaftNode, RebalanceSafeModeGuard,
    };
    pub use crate::cluster::{
        Assignment, AssignmentService, AssignmentServiceExt, ClusterConfig, ClusterNode,
        ClusterNodeRuntime, Clock, CoordinationError, CoordinationResult, CoordinationStore,
        DistributedLockService, InMemoryAssignmentService, InMemoryCoordinationStore,
        KeyAssignment, LeaderElectionMode, LeaderElectionService, LeaderInfo, LockRecord,
        MembershipService, SystemClock,
    };
}
