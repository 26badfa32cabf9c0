//! Raft node wrapper for one replicated group.
//!
//! Wraps an openraft [`Raft`] over a [`RaftStore`] and exposes it to the
//! rest of the crate as a [`CommandProposer`] for writes and, through
//! [`RaftLeaderView`], as a read-only [`LeaderElectionService`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::network::RaftNetworkFactory;
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft, RaftMetrics};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{CommandResponse, RaftCommandEnvelope};
use super::config::RaftServerConfig;
use super::proposer::CommandProposer;
use super::state_machine::ClusterStateMachine;
use super::storage::RaftStore;
use super::types::{RaftNodeId, RaftNodeInfo, TypeConfig};
use crate::cluster::clock::Clock;
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::leader::{LeaderElectionMode, LeaderElectionService, LeaderInfo, LeaderWatcher};
use crate::cluster::metrics;

/// Proposals allowed in flight before callers wait.
pub const DEFAULT_MAX_PENDING_PROPOSALS: usize = 1024;

type MemberMap = Arc<RwLock<BTreeMap<RaftNodeId, RaftNodeInfo>>>;

/// Membership node id for `raft_id`, falling back to the numeric id.
fn cluster_node_id(members: &MemberMap, raft_id: RaftNodeId) -> String {
    members
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&raft_id)
        .map(|m| m.cluster_node_id.clone())
        .unwrap_or_else(|| raft_id.to_string())
}

pub struct RaftNode {
    raft: Raft<TypeConfig>,
    state_machine: Arc<ClusterStateMachine>,
    local: RaftNodeInfo,
    members: MemberMap,
    proposal_semaphore: Arc<Semaphore>,
    proposal_timeout: Duration,
    election_timeout: Duration,
}

impl RaftNode {
    /// Start a node for the state machine's group over `network`.
    ///
    /// `state_machine` should already be started so a persisted snapshot
    /// is in place before the log is replayed.
    pub async fn start<N>(
        config: &RaftServerConfig,
        local: RaftNodeInfo,
        network: N,
        state_machine: Arc<ClusterStateMachine>,
    ) -> CoordinationResult<Self>
    where
        N: RaftNetworkFactory<TypeConfig>,
    {
        if let Err(errors) = config.validate() {
            return Err(CoordinationError::Config(format!(
                "Invalid Raft config: {}",
                errors.join(", ")
            )));
        }
        let group_id = state_machine.group_id().to_string();
        let openraft_config = config
            .to_openraft_config(&group_id)
            .validate()
            .map_err(|e| CoordinationError::Config(e.to_string()))?;

        let store = RaftStore::open(state_machine.clone()).await?;
        let (log_store, sm_store) = Adaptor::new(store);
        let raft = Raft::new(
            local.raft_id,
            Arc::new(openraft_config),
            network,
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| CoordinationError::Raft(format!("Failed to create Raft node: {e}")))?;

        let members = Arc::new(RwLock::new(BTreeMap::from([(local.raft_id, local.clone())])));
        info!(
            group_id = %group_id,
            raft_id = local.raft_id,
            raft_addr = %local.raft_addr,
            "Raft node started"
        );

        Ok(Self {
            raft,
            state_machine,
            local,
            members,
            proposal_semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_PROPOSALS)),
            proposal_timeout: config.rpc_timeout,
            election_timeout: config.election_timeout_max,
        })
    }

    /// Handle for registering with a transport.
    pub fn raft(&self) -> Raft<TypeConfig> {
        self.raft.clone()
    }

    pub fn raft_id(&self) -> RaftNodeId {
        self.local.raft_id
    }

    pub fn group_id(&self) -> &str {
        self.state_machine.group_id()
    }

    pub fn state_machine(&self) -> Arc<ClusterStateMachine> {
        self.state_machine.clone()
    }

    /// Remember how a peer maps to a membership node id.
    pub fn register_member(&self, member: RaftNodeInfo) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member.raft_id, member);
    }

    /// Bootstrap the group with `members` as the initial voters. Only one
    /// node calls this. A group that already has voters, from an earlier
    /// initialization or a restored snapshot, is left as it is.
    pub async fn initialize(&self, members: &[RaftNodeInfo]) -> CoordinationResult<()> {
        let mut voters = BTreeMap::new();
        for member in members.iter().chain(std::iter::once(&self.local)) {
            self.register_member(member.clone());
            voters.insert(member.raft_id, member.basic_node());
        }

        match self.raft.initialize(voters).await {
            Ok(()) => {}
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!(group_id = %self.group_id(), raft_id = self.raft_id(), "Group already initialized");
                return Ok(());
            }
            Err(e) => {
                return Err(CoordinationError::Raft(format!("Failed to initialize group: {e}")));
            }
        }
        info!(
            group_id = %self.group_id(),
            raft_id = self.raft_id(),
            voters = members.len() + 1,
            "Group initialized"
        );
        Ok(())
    }

    /// Add a node as a non-voting learner.
    pub async fn add_learner(&self, member: RaftNodeInfo) -> CoordinationResult<()> {
        self.register_member(member.clone());
        self.raft
            .add_learner(member.raft_id, member.basic_node(), true)
            .await
            .map_err(|e| CoordinationError::Raft(format!("Failed to add learner: {e}")))?;
        info!(group_id = %self.group_id(), raft_id = member.raft_id, "Added learner");
        Ok(())
    }

    /// Replace the voter set.
    pub async fn change_membership(
        &self,
        voters: impl IntoIterator<Item = RaftNodeId>,
    ) -> CoordinationResult<()> {
        let voters: BTreeSet<_> = voters.into_iter().collect();
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| CoordinationError::Raft(format!("Failed to change membership: {e}")))?;
        info!(group_id = %self.group_id(), "Membership changed");
        Ok(())
    }

    /// Confirm leadership with a quorum and wait for local apply to catch up.
    pub async fn ensure_linearizable(&self) -> CoordinationResult<()> {
        self.raft.ensure_linearizable().await.map_err(|e| match e {
            RaftError::APIError(openraft::error::CheckIsLeaderError::ForwardToLeader(f)) => {
                CoordinationError::NotLeader {
                    leader: f.leader_id,
                }
            }
            other => CoordinationError::Raft(other.to_string()),
        })?;
        Ok(())
    }

    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn current_term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.local.raft_id)
    }

    /// Whether the group has voters, from initialization or a snapshot.
    pub fn is_initialized(&self) -> bool {
        let metrics_watch = self.raft.metrics();
        let metrics = metrics_watch.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    pub fn metrics(&self) -> RaftMetrics<RaftNodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Wait until some node is leader, up to `wait`.
    pub async fn wait_for_leader(&self, wait: Duration) -> CoordinationResult<RaftNodeId> {
        let metrics = self
            .raft
            .wait(Some(wait))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|e| CoordinationError::Raft(e.to_string()))?;
        metrics
            .current_leader
            .ok_or_else(|| CoordinationError::Raft("no leader elected".into()))
    }

    /// Read-only leader view of this group.
    pub fn leader_view(&self) -> RaftLeaderView {
        RaftLeaderView {
            raft: self.raft.clone(),
            group_id: self.group_id().to_string(),
            members: self.members.clone(),
            clock: self.state_machine.clock(),
            lease: self.election_timeout,
            elected: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn shutdown(&self) -> CoordinationResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| CoordinationError::Raft(format!("Failed to shut down Raft: {e}")))?;
        info!(group_id = %self.group_id(), raft_id = self.raft_id(), "Raft node shut down");
        Ok(())
    }
}

#[async_trait]
impl CommandProposer for RaftNode {
    async fn propose_envelope(
        &self,
        envelope: RaftCommandEnvelope,
    ) -> CoordinationResult<CommandResponse> {
        let _permit = match timeout(self.proposal_timeout, self.proposal_semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CoordinationError::Raft("proposal semaphore closed".into())),
            Err(_) => {
                return Err(CoordinationError::Raft(format!(
                    "too many pending proposals (max {DEFAULT_MAX_PENDING_PROPOSALS})"
                )));
            }
        };

        let command_type = envelope.command_type();
        let started = Instant::now();
        match self.raft.client_write(envelope).await {
            Ok(response) => {
                debug!(
                    group_id = %self.group_id(),
                    command = %command_type,
                    index = response.log_id.index,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Proposal committed"
                );
                Ok(response.data)
            }
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(f))) => {
                Err(CoordinationError::NotLeader {
                    leader: f.leader_id,
                })
            }
            Err(e) => {
                metrics::record_apply_error("raft");
                warn!(group_id = %self.group_id(), command = %command_type, error = %e, "Proposal failed");
                Err(CoordinationError::Raft(e.to_string()))
            }
        }
    }
}

/// [`LeaderElectionService`] answering from the consensus engine.
///
/// Leadership is decided by Raft elections, so acquire only confirms that
/// the caller already leads and release never succeeds. The reported lease
/// is one maximum election timeout from the read.
#[derive(Clone)]
pub struct RaftLeaderView {
    raft: Raft<TypeConfig>,
    group_id: String,
    members: MemberMap,
    clock: Arc<dyn Clock>,
    lease: Duration,
    /// (term, leader) last seen and when it was first seen.
    elected: Arc<RwLock<Option<(u64, RaftNodeId, u64)>>>,
}

impl RaftLeaderView {
    fn leader_from(&self, term: u64, leader: Option<RaftNodeId>) -> Option<LeaderInfo> {
        let leader = leader?;
        let now = self.clock.now_ms();
        let elected_at_ms = {
            let mut elected = self.elected.write().unwrap_or_else(PoisonError::into_inner);
            match *elected {
                Some((t, l, at)) if t == term && l == leader => at,
                _ => {
                    *elected = Some((term, leader, now));
                    now
                }
            }
        };
        Some(LeaderInfo {
            group_id: self.group_id.clone(),
            leader_node_id: cluster_node_id(&self.members, leader),
            mode: LeaderElectionMode::Raft,
            term,
            elected_at_ms,
            lease_expires_at_ms: now.saturating_add(self.lease.as_millis() as u64),
        })
    }

    fn current(&self) -> Option<LeaderInfo> {
        let (term, leader) = {
            let metrics = self.raft.metrics();
            let m = metrics.borrow();
            (m.current_term, m.current_leader)
        };
        self.leader_from(term, leader)
    }

    fn check_group(&self, group_id: &str) -> CoordinationResult<()> {
        if group_id != self.group_id {
            return Err(CoordinationError::GroupMismatch {
                machine_group: self.group_id.clone(),
                command_group: group_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderElectionService for RaftLeaderView {
    fn mode(&self) -> LeaderElectionMode {
        LeaderElectionMode::Raft
    }

    async fn try_acquire_leader(
        &self,
        group_id: &str,
        node_id: &str,
        _mode: LeaderElectionMode,
        _lease: Duration,
    ) -> CoordinationResult<Option<LeaderInfo>> {
        self.check_group(group_id)?;
        let held = self.current().filter(|info| info.is_held_by(node_id));
        metrics::record_leader_acquisition(LeaderElectionMode::Raft.as_str(), held.is_some());
        Ok(held)
    }

    async fn release(&self, group_id: &str, _node_id: &str) -> CoordinationResult<bool> {
        self.check_group(group_id)?;
        Ok(false)
    }

    async fn get_leader(&self, group_id: &str) -> CoordinationResult<Option<LeaderInfo>> {
        self.check_group(group_id)?;
        Ok(self.current())
    }

    fn watch(&self, group_id: &str) -> LeaderWatcher {
        let view = self.clone();
        let rx = self.raft.metrics();
        let last = {
            let m = rx.borrow();
            m.current_leader.map(|l| (m.current_term, l))
        };

        let stream = futures::stream::unfold((rx, last, view), |(mut rx, mut last, view)| async move {
            loop {
                rx.changed().await.ok()?;
                let (term, leader) = {
                    let m = rx.borrow();
                    (m.current_term, m.current_leader)
                };
                let Some(leader) = leader else { continue };
                if last == Some((term, leader)) {
                    continue;
                }
                last = Some((term, leader));
                if let Some(info) = view.leader_from(term, Some(leader)) {
                    return Some((info, (rx, last, view)));
                }
            }
        });
        LeaderWatcher::new(group_id, stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::clock::SystemClock;
    use crate::cluster::raft::commands::{AssignPartitionCommand, RaftCommand};
    use crate::cluster::raft::network::InProcessRouter;
    use crate::cluster::raft::snapshot::FileSnapshotStore;

    fn fast_config() -> RaftServerConfig {
        RaftServerConfig {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            snapshot_threshold: 0,
            ..RaftServerConfig::default()
        }
    }

    async fn single_node(dir: &std::path::Path) -> RaftNode {
        let router = InProcessRouter::new();
        let sm = Arc::new(ClusterStateMachine::new(
            "g1",
            Arc::new(FileSnapshotStore::new(dir)),
            Arc::new(SystemClock),
            0,
        ));
        let node = RaftNode::start(
            &fast_config(),
            RaftNodeInfo::new(1, "local-1", "node-1"),
            router.factory(1),
            sm,
        )
        .await
        .unwrap();
        router.register(1, node.raft());
        node
    }

    #[tokio::test]
    async fn test_single_node_proposes_and_leads() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        assert!(!node.is_initialized());

        node.initialize(&[]).await.unwrap();
        assert_eq!(node.wait_for_leader(Duration::from_secs(5)).await.unwrap(), 1);
        assert!(node.is_leader());

        let response = node
            .propose(RaftCommand::AssignPartition(AssignPartitionCommand {
                group_id: "g1".into(),
                partition: 0,
                owner_node_id: "node-1".into(),
                affinities: BTreeMap::new(),
                equipment_ids: vec![],
                workflow_handoff: None,
                timestamp_ms: 1,
            }))
            .await
            .unwrap();
        assert!(matches!(response, CommandResponse::PartitionAssigned(_)));
        assert!(node.state_machine().find_assignment(0).await.is_some());

        let view = node.leader_view();
        let leader = view.get_leader("g1").await.unwrap().unwrap();
        assert_eq!(leader.leader_node_id, "node-1");
        assert!(
            view.try_acquire_leader("g1", "node-2", LeaderElectionMode::Raft, Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!view.release("g1", "node-1").await.unwrap());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_view_rejects_other_group() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        assert!(matches!(
            node.leader_view().get_leader("other").await,
            Err(CoordinationError::GroupMismatch { .. })
        ));
        node.shutdown().await.unwrap();
    }
}
