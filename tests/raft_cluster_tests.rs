//! Multi-node replication over the in-process transport.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clusterkernel::cluster::raft::{
    AssignPartitionCommand, ClusterStateMachine, CommandProposer, CommandResponse,
    FileSnapshotStore, InProcessRouter, RaftAssignmentService, RaftCommand, RaftLockService,
    RaftNode, RaftNodeId, RaftNodeInfo, RaftServerConfig,
};
use clusterkernel::cluster::{
    Assignment, AssignmentService, CoordinationError, DistributedLockService, LeaderElectionService,
    SystemClock,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn fast_config() -> RaftServerConfig {
    RaftServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(200),
        election_timeout_max: Duration::from_millis(400),
        snapshot_threshold: 0,
        ..RaftServerConfig::default()
    }
}

fn info(id: RaftNodeId) -> RaftNodeInfo {
    RaftNodeInfo::new(id, format!("local-{id}"), format!("node-{id}"))
}

struct TestCluster {
    router: InProcessRouter,
    nodes: Vec<Arc<RaftNode>>,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    async fn start(size: u64) -> Self {
        let router = InProcessRouter::new();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for id in 1..=size {
            let dir = tempfile::tempdir().unwrap();
            nodes.push(start_node(&router, id, dir.path()).await);
            dirs.push(dir);
        }
        for node in &nodes {
            for id in 1..=size {
                node.register_member(info(id));
            }
        }
        let peers: Vec<_> = (2..=size).map(info).collect();
        nodes[0].initialize(&peers).await.unwrap();
        for node in &nodes {
            node.wait_for_leader(Duration::from_secs(10)).await.unwrap();
        }
        Self {
            router,
            nodes,
            _dirs: dirs,
        }
    }

    fn leader(&self) -> Arc<RaftNode> {
        let id = self.nodes[0].current_leader().expect("leader elected");
        self.node(id)
    }

    fn node(&self, id: RaftNodeId) -> Arc<RaftNode> {
        self.nodes[(id - 1) as usize].clone()
    }

    fn followers(&self) -> Vec<Arc<RaftNode>> {
        let leader = self.leader().raft_id();
        self.nodes
            .iter()
            .filter(|n| n.raft_id() != leader)
            .cloned()
            .collect()
    }

    async fn shutdown(self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

fn state_machine(dir: &Path) -> Arc<ClusterStateMachine> {
    Arc::new(ClusterStateMachine::new(
        "orders",
        Arc::new(FileSnapshotStore::new(dir)),
        Arc::new(SystemClock),
        0,
    ))
}

/// Start raft node `id` over the snapshots in `dir` and route to it.
async fn start_node(router: &InProcessRouter, id: RaftNodeId, dir: &Path) -> Arc<RaftNode> {
    let sm = state_machine(dir);
    sm.start().await.unwrap();
    let node = RaftNode::start(&fast_config(), info(id), router.factory(id), sm)
        .await
        .unwrap();
    router.register(id, node.raft());
    Arc::new(node)
}

fn assign_partition(partition: i32, owner: &str) -> RaftCommand {
    RaftCommand::AssignPartition(AssignPartitionCommand {
        group_id: "orders".into(),
        partition,
        owner_node_id: owner.into(),
        affinities: BTreeMap::new(),
        equipment_ids: vec![],
        workflow_handoff: None,
        timestamp_ms: 1,
    })
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test]
async fn test_assignments_replicate_to_followers() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader();
    let service = RaftAssignmentService::new(leader.clone(), leader.state_machine());

    let applied = service
        .apply_assignments("orders", vec![Assignment::new("orders", 0, "node-1")])
        .await
        .unwrap();
    assert_eq!(applied[0].version, 1);
    service
        .apply_assignments("orders", vec![Assignment::new("orders", 0, "node-2")])
        .await
        .unwrap();

    for follower in cluster.followers() {
        let sm = follower.state_machine();
        assert!(
            eventually(|| {
                let sm = sm.clone();
                async move {
                    sm.find_assignment(0)
                        .await
                        .is_some_and(|a| a.version == 2 && a.owner_node_id == "node-2")
                }
            })
            .await,
            "follower {} did not catch up",
            follower.raft_id()
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_locks_replicate_and_stay_exclusive() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader();
    let locks = RaftLockService::new(leader.clone(), leader.state_machine());
    let lease = Duration::from_secs(30);

    let held = locks
        .try_acquire("compaction", "node-1", lease, BTreeMap::new())
        .await
        .unwrap();
    assert!(held.is_some());
    assert!(
        locks
            .try_acquire("compaction", "node-2", lease, BTreeMap::new())
            .await
            .unwrap()
            .is_none()
    );

    for follower in cluster.followers() {
        let sm = follower.state_machine();
        assert!(
            eventually(|| {
                let sm = sm.clone();
                async move {
                    sm.get_lock("compaction")
                        .await
                        .is_some_and(|l| l.owner_node_id == "node-1")
                }
            })
            .await
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_proposals_with_leader_hint() {
    let cluster = TestCluster::start(3).await;
    let leader_id = cluster.leader().raft_id();
    let follower = cluster.followers().remove(0);
    let service = RaftAssignmentService::new(follower.clone(), follower.state_machine());

    let result = service
        .apply_assignments("orders", vec![Assignment::new("orders", 1, "node-3")])
        .await;
    match result {
        Err(CoordinationError::NotLeader { leader }) => assert_eq!(leader, Some(leader_id)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_view_agrees_across_nodes() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader();
    let expected = format!("node-{}", leader.raft_id());

    for id in 1..=3 {
        let view = cluster.node(id).leader_view();
        let info = view.get_leader("orders").await.unwrap().unwrap();
        assert_eq!(info.leader_node_id, expected);
        assert_eq!(info.term, leader.current_term());
    }

    cluster.shutdown().await;
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_new_leader_elected_after_isolation() {
    let cluster = TestCluster::start(3).await;
    let old_leader = cluster.leader();
    let old_term = old_leader.current_term();
    cluster.router.isolate(old_leader.raft_id());

    let survivor = cluster.followers().remove(0);
    assert!(
        eventually(|| {
            let survivor = survivor.clone();
            let old = old_leader.raft_id();
            async move {
                survivor
                    .current_leader()
                    .is_some_and(|id| id != old)
            }
        })
        .await,
        "no new leader after isolating {}",
        old_leader.raft_id()
    );
    assert!(survivor.current_term() > old_term);

    let new_leader = cluster.node(survivor.current_leader().unwrap());
    let response = new_leader
        .propose(assign_partition(2, "node-3"))
        .await
        .unwrap();
    assert!(matches!(response, CommandResponse::PartitionAssigned(_)));

    cluster.router.heal(old_leader.raft_id());
    cluster.shutdown().await;
}

// ============================================================================
// Membership changes
// ============================================================================

#[tokio::test]
async fn test_learner_joins_and_becomes_voter() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.leader();
    let dir = tempfile::tempdir().unwrap();
    let joiner = start_node(&cluster.router, 4, dir.path()).await;
    for id in 1..=4 {
        joiner.register_member(info(id));
    }

    leader.add_learner(info(4)).await.unwrap();
    leader.change_membership(1..=4).await.unwrap();
    assert!(
        eventually(|| {
            let joiner = joiner.clone();
            async move {
                joiner
                    .metrics()
                    .membership_config
                    .membership()
                    .voter_ids()
                    .any(|id| id == 4)
            }
        })
        .await
    );

    leader
        .propose(assign_partition(5, "node-4"))
        .await
        .unwrap();
    let sm = joiner.state_machine();
    assert!(
        eventually(|| {
            let sm = sm.clone();
            async move { sm.find_assignment(5).await.is_some() }
        })
        .await
    );

    leader.ensure_linearizable().await.unwrap();
    let follower = cluster.followers().remove(0);
    assert!(matches!(
        follower.ensure_linearizable().await,
        Err(CoordinationError::NotLeader { leader: Some(id) }) if id == leader.raft_id()
    ));

    let _ = joiner.shutdown().await;
    cluster.shutdown().await;
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_from_snapshot_applies_new_proposals() {
    let dir = tempfile::tempdir().unwrap();
    let router = InProcessRouter::new();

    let node = start_node(&router, 1, dir.path()).await;
    node.initialize(&[]).await.unwrap();
    node.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    for partition in 0..5 {
        node.propose(assign_partition(partition, "node-1"))
            .await
            .unwrap();
    }
    let snapshot = node.state_machine().take_snapshot().await.unwrap();
    node.shutdown().await.unwrap();
    router.unregister(1);

    let restarted = start_node(&router, 1, dir.path()).await;
    let sm = restarted.state_machine();
    assert_eq!(
        sm.last_applied().await.map(|p| p.index as i64),
        Some(snapshot.index)
    );
    restarted.initialize(&[]).await.unwrap();
    restarted
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();
    assert!(
        eventually(|| {
            let restarted = restarted.clone();
            async move { restarted.is_leader() }
        })
        .await
    );
    assert!(restarted.current_term() > snapshot.term as u64);

    let response = restarted
        .propose(assign_partition(42, "node-9"))
        .await
        .unwrap();
    assert!(matches!(
        response,
        CommandResponse::PartitionAssigned(ref a) if a.owner_node_id == "node-9"
    ));
    assert_eq!(sm.find_assignment(42).await.unwrap().owner_node_id, "node-9");
    assert_eq!(sm.assignments().await.len(), 6);
    assert!(sm.last_applied().await.unwrap().index as i64 > snapshot.index);

    restarted.shutdown().await.unwrap();
}
