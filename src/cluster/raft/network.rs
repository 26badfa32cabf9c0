//! In-process Raft transport.
//!
//! [`InProcessRouter`] delivers RPCs by calling the target [`Raft`] handle
//! directly. It serves single-process deployments that host several groups
//! and tests that need a real multi-node group. Nodes can be isolated to
//! simulate a partition.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use tracing::debug;

use super::types::{RaftNodeId, TypeConfig};

#[derive(Default)]
struct Routes {
    nodes: DashMap<RaftNodeId, Raft<TypeConfig>>,
    isolated: RwLock<HashSet<RaftNodeId>>,
}

/// Shared routing table. Clones see the same nodes.
#[derive(Clone, Default)]
pub struct InProcessRouter {
    routes: Arc<Routes>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RaftNodeId, raft: Raft<TypeConfig>) {
        self.routes.nodes.insert(id, raft);
    }

    pub fn unregister(&self, id: RaftNodeId) {
        self.routes.nodes.remove(&id);
    }

    /// Drop all traffic to and from `id` until [`heal`](Self::heal).
    pub fn isolate(&self, id: RaftNodeId) {
        self.routes
            .isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        debug!(raft_id = id, "Isolated node");
    }

    pub fn heal(&self, id: RaftNodeId) {
        self.routes
            .isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        debug!(raft_id = id, "Healed node");
    }

    fn is_isolated(&self, id: RaftNodeId) -> bool {
        self.routes
            .isolated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Target handle, or why it cannot be reached from `source`.
    fn route(&self, source: RaftNodeId, target: RaftNodeId) -> Result<Raft<TypeConfig>, Unreachable> {
        if self.is_isolated(source) || self.is_isolated(target) {
            return Err(Unreachable::new(&std::io::Error::other(format!(
                "link {source} -> {target} is partitioned"
            ))));
        }
        self.routes
            .nodes
            .get(&target)
            .map(|raft| raft.clone())
            .ok_or_else(|| {
                Unreachable::new(&std::io::Error::other(format!(
                    "node {target} is not registered"
                )))
            })
    }

    /// Factory for the node `source`.
    pub fn factory(&self, source: RaftNodeId) -> InProcessNetwork {
        InProcessNetwork {
            router: self.clone(),
            source,
        }
    }
}

/// Network factory handed to one node's [`Raft`].
#[derive(Clone)]
pub struct InProcessNetwork {
    router: InProcessRouter,
    source: RaftNodeId,
}

impl RaftNetworkFactory<TypeConfig> for InProcessNetwork {
    type Network = InProcessConnection;

    async fn new_client(&mut self, target: RaftNodeId, _node: &BasicNode) -> Self::Network {
        InProcessConnection {
            router: self.router.clone(),
            source: self.source,
            target,
        }
    }
}

pub struct InProcessConnection {
    router: InProcessRouter,
    source: RaftNodeId,
    target: RaftNodeId,
}

fn remote_failure<E: std::fmt::Display>(err: E) -> NetworkError {
    NetworkError::new(&std::io::Error::other(err.to_string()))
}

impl RaftNetwork<TypeConfig> for InProcessConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        let raft = self
            .router
            .route(self.source, self.target)
            .map_err(RPCError::Unreachable)?;
        raft.append_entries(req)
            .await
            .map_err(|e| RPCError::Network(remote_failure(e)))
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        let raft = self
            .router
            .route(self.source, self.target)
            .map_err(RPCError::Unreachable)?;
        raft.vote(req)
            .await
            .map_err(|e| RPCError::Network(remote_failure(e)))
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        let raft = self
            .router
            .route(self.source, self.target)
            .map_err(RPCError::Unreachable)?;
        raft.install_snapshot(req)
            .await
            .map_err(|e| RPCError::Network(remote_failure(e)))
    }
}
