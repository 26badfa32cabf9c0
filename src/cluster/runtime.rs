//! Composition root for one local node.
//!
//! [`ClusterNodeRuntime`] wires membership, leader election, locks and an
//! optional replicated state machine around the node described by a
//! [`ClusterConfig`], and tracks what the node holds so that
//! [`shutdown`](ClusterNodeRuntime::shutdown) can hand it back.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clusterkernel::cluster::{
//!     ClusterConfig, ClusterNodeRuntime, InMemoryCoordinationStore, SystemClock,
//! };
//!
//! # async fn run() -> Result<(), clusterkernel::cluster::CoordinationError> {
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
//! let runtime = ClusterNodeRuntime::new(ClusterConfig::from_env()?, store, clock)?;
//! runtime.start().await?;
//!
//! if runtime.try_acquire_leader("orders").await?.is_some() {
//!     // lead "orders"
//! }
//!
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::background_tasks::BackgroundTaskRegistry;
use super::clock::Clock;
use super::config::ClusterConfig;
use super::error::{CoordinationError, CoordinationResult};
use super::leader::{
    CasLeaderElectionService, KafkaLeaderElectionService, LeaderElectionMode,
    LeaderElectionService, LeaderInfo, RAFT_LEADER_PREFIX,
};
use super::lock::{DistributedLockService, LockRecord, StoreLockService};
use super::membership::{ClusterNode, HeartbeatMonitor, MembershipService, NodeRecord};
use super::raft::{
    ClusterStateMachine, LeaderProcessingGuard, RebalanceSafeModeGuard, StateMachineMetrics,
};
use super::store::CoordinationStore;

/// Replicated state hosted by this node plus the view of who leads it.
struct ReplicatedGroup {
    state_machine: Arc<ClusterStateMachine>,
    leader_view: Arc<dyn LeaderElectionService>,
}

pub struct ClusterNodeRuntime {
    config: ClusterConfig,
    local: ClusterNode,
    membership: Arc<MembershipService>,
    monitor: Mutex<HeartbeatMonitor>,
    leader_election: Arc<dyn LeaderElectionService>,
    locks: Arc<dyn DistributedLockService>,
    replicated: Option<ReplicatedGroup>,
    safe_mode: Arc<RebalanceSafeModeGuard>,
    guard_metrics: Arc<StateMachineMetrics>,
    snapshot_interval: Option<Duration>,
    tasks: Mutex<BackgroundTaskRegistry>,
    held_locks: Mutex<BTreeSet<String>>,
    led_groups: Mutex<BTreeSet<String>>,
    stopped: AtomicBool,
}

impl ClusterNodeRuntime {
    /// Build a runtime with store-backed services for `config.mode`.
    pub fn new(
        config: ClusterConfig,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> CoordinationResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(CoordinationError::Config(format!(
                "Invalid cluster config: {}",
                errors.join(", ")
            )));
        }

        let local = config.local_node();
        let membership = Arc::new(MembershipService::new(
            store.clone(),
            clock.clone(),
            config.membership(),
        ));
        let leader_election: Arc<dyn LeaderElectionService> = match config.mode {
            LeaderElectionMode::Raft => Arc::new(CasLeaderElectionService::with_prefix(
                store.clone(),
                clock.clone(),
                RAFT_LEADER_PREFIX,
            )),
            LeaderElectionMode::Kafka => Arc::new(KafkaLeaderElectionService::new(clock.clone())),
        };
        let locks = Arc::new(StoreLockService::new(store, clock.clone()));

        Ok(Self {
            monitor: Mutex::new(HeartbeatMonitor::new(membership.clone(), local.clone())),
            safe_mode: Arc::new(RebalanceSafeModeGuard::with_clock(
                local.node_id.clone(),
                clock.clone(),
            )),
            guard_metrics: Arc::new(StateMachineMetrics::new(local.node_id.clone())),
            config,
            local,
            membership,
            leader_election,
            locks,
            replicated: None,
            snapshot_interval: None,
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
            held_locks: Mutex::new(BTreeSet::new()),
            led_groups: Mutex::new(BTreeSet::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn with_leader_election(mut self, leader_election: Arc<dyn LeaderElectionService>) -> Self {
        self.leader_election = leader_election;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn DistributedLockService>) -> Self {
        self.locks = locks;
        self
    }

    /// Host a replicated state machine. `leader_view` tells whether this
    /// node leads its group; the machine's safe-mode guard becomes the
    /// runtime's guard.
    pub fn with_state_machine(
        mut self,
        state_machine: Arc<ClusterStateMachine>,
        leader_view: Arc<dyn LeaderElectionService>,
    ) -> Self {
        self.safe_mode = state_machine.safe_mode_guard();
        self.guard_metrics = state_machine.metrics();
        self.replicated = Some(ReplicatedGroup {
            state_machine,
            leader_view,
        });
        self
    }

    /// Snapshot the state machine on this period while leading its group.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    pub fn node_id(&self) -> &str {
        &self.local.node_id
    }

    pub fn membership(&self) -> Arc<MembershipService> {
        self.membership.clone()
    }

    pub fn leader_election(&self) -> Arc<dyn LeaderElectionService> {
        self.leader_election.clone()
    }

    pub fn locks(&self) -> Arc<dyn DistributedLockService> {
        self.locks.clone()
    }

    pub fn state_machine(&self) -> Option<Arc<ClusterStateMachine>> {
        self.replicated.as_ref().map(|r| r.state_machine.clone())
    }

    pub fn safe_mode(&self) -> Arc<RebalanceSafeModeGuard> {
        self.safe_mode.clone()
    }

    /// Join the cluster and start the periodic loops.
    pub async fn start(&self) -> CoordinationResult<NodeRecord> {
        self.stopped.store(false, Ordering::SeqCst);
        if let Some(replicated) = &self.replicated {
            replicated.state_machine.start().await?;
        }
        let record = self.monitor.lock().await.start().await?;

        if let (Some(replicated), Some(interval)) = (&self.replicated, self.snapshot_interval) {
            let state_machine = replicated.state_machine.clone();
            let leader_view = replicated.leader_view.clone();
            let node_id = self.local.node_id.clone();
            let mut tasks = self.tasks.lock().await;
            if tasks.is_shutting_down() {
                *tasks = BackgroundTaskRegistry::new();
            }
            tasks.spawn_periodic("snapshot-tick", interval, move |tick| {
                let state_machine = state_machine.clone();
                let leader_view = leader_view.clone();
                let node_id = node_id.clone();
                async move {
                    if tick == 0 {
                        return;
                    }
                    if !leads(leader_view.as_ref(), state_machine.group_id(), &node_id).await {
                        return;
                    }
                    if let Err(e) = state_machine.take_snapshot().await {
                        warn!(group_id = %state_machine.group_id(), error = %e, "Periodic snapshot failed");
                    }
                }
            });
        }

        info!(node_id = %self.local.node_id, mode = %self.config.mode, "Cluster node started");
        Ok(record)
    }

    /// Acquire leadership of `group_id` for this node with the configured lease.
    pub async fn try_acquire_leader(&self, group_id: &str) -> CoordinationResult<Option<LeaderInfo>> {
        let acquired = self
            .leader_election
            .try_acquire_leader(
                group_id,
                &self.local.node_id,
                self.leader_election.mode(),
                self.config.leader_lease,
            )
            .await?;
        if acquired.is_some() {
            self.led_groups.lock().await.insert(group_id.to_string());
        }
        Ok(acquired)
    }

    pub async fn release_leader(&self, group_id: &str) -> CoordinationResult<bool> {
        self.led_groups.lock().await.remove(group_id);
        self.leader_election
            .release(group_id, &self.local.node_id)
            .await
    }

    /// Acquire `name` for this node with the configured lock lease.
    pub async fn acquire_lock(
        &self,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> CoordinationResult<Option<LockRecord>> {
        let acquired = self
            .locks
            .try_acquire(name, &self.local.node_id, self.config.lock_lease, metadata)
            .await?;
        if acquired.is_some() {
            self.held_locks.lock().await.insert(name.to_string());
        }
        Ok(acquired)
    }

    pub async fn release_lock(&self, name: &str) -> CoordinationResult<bool> {
        self.held_locks.lock().await.remove(name);
        self.locks.release(name, &self.local.node_id).await
    }

    /// Processing gate for `group_id` with the runtime's safe-mode guard.
    ///
    /// The hosted replicated group answers leadership from its leader view;
    /// any other group uses the runtime's leader election.
    pub fn processing_guard(&self, group_id: &str) -> LeaderProcessingGuard {
        let leader_source = match &self.replicated {
            Some(replicated) if replicated.state_machine.group_id() == group_id => {
                replicated.leader_view.clone()
            }
            _ => self.leader_election.clone(),
        };
        LeaderProcessingGuard::new(
            leader_source,
            group_id,
            self.local.node_id.clone(),
            self.safe_mode.clone(),
            self.guard_metrics.clone(),
        )
    }

    /// Stop loops and leave, release what this node still owns, then flush
    /// a final snapshot when leading the replicated group.
    ///
    /// Each step is bounded by `shutdown_timeout`. A step that times out is
    /// skipped and the first such timeout is returned once all steps ran.
    pub async fn shutdown(&self) -> CoordinationResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let step = self.config.shutdown_timeout;
        info!(node_id = %self.local.node_id, timeout_ms = step.as_millis() as u64, "Shutting down cluster node");

        let mut first_timeout = None;

        let report = self.tasks.lock().await.shutdown_all_with_timeout(step).await;
        if !report.aborted.is_empty() {
            warn!(aborted = ?report.aborted, "Runtime tasks aborted at shutdown");
        }

        let outcome = timeout(step, async {
            self.monitor.lock().await.stop(step).await
        })
        .await;
        note_step("membership", outcome, &mut first_timeout);

        let outcome = timeout(step, self.release_held()).await;
        note_step("release", outcome.map(Ok), &mut first_timeout);

        if let Some(replicated) = &self.replicated {
            let outcome = timeout(step, self.final_snapshot(replicated)).await;
            note_step("final snapshot", outcome, &mut first_timeout);
            replicated.state_machine.stop();
        }

        match first_timeout {
            Some(step) => Err(CoordinationError::ShutdownTimeout(step)),
            None => {
                info!(node_id = %self.local.node_id, "Cluster node stopped");
                Ok(())
            }
        }
    }

    async fn release_held(&self) {
        let node_id = self.local.node_id.as_str();

        let locks = std::mem::take(&mut *self.held_locks.lock().await);
        for name in locks {
            match self.locks.get_lock(&name).await {
                Ok(Some(record)) if record.is_owned_by(node_id) => {
                    if let Err(e) = self.locks.release(&name, node_id).await {
                        warn!(lock = %name, error = %e, "Failed to release lock at shutdown");
                    }
                }
                Ok(_) => debug!(lock = %name, "Lock no longer held, skipping release"),
                Err(e) => warn!(lock = %name, error = %e, "Failed to read lock at shutdown"),
            }
        }

        let groups = std::mem::take(&mut *self.led_groups.lock().await);
        for group_id in groups {
            match self.leader_election.get_leader(&group_id).await {
                Ok(Some(info)) if info.is_held_by(node_id) => {
                    if let Err(e) = self.leader_election.release(&group_id, node_id).await {
                        warn!(group_id = %group_id, error = %e, "Failed to release leadership at shutdown");
                    }
                }
                Ok(_) => debug!(group_id = %group_id, "Leadership already lost, skipping release"),
                Err(e) => warn!(group_id = %group_id, error = %e, "Failed to read leader at shutdown"),
            }
        }
    }

    async fn final_snapshot(&self, replicated: &ReplicatedGroup) -> CoordinationResult<()> {
        let state_machine = &replicated.state_machine;
        if !leads(replicated.leader_view.as_ref(), state_machine.group_id(), &self.local.node_id).await {
            debug!(group_id = %state_machine.group_id(), "Not the replicated leader, skipping final snapshot");
            return Ok(());
        }
        let snapshot = state_machine.take_snapshot().await?;
        info!(
            group_id = %state_machine.group_id(),
            index = snapshot.index,
            "Final snapshot flushed"
        );
        Ok(())
    }

}

async fn leads(leader_view: &dyn LeaderElectionService, group_id: &str, node_id: &str) -> bool {
    match leader_view.get_leader(group_id).await {
        Ok(Some(info)) => info.is_held_by(node_id),
        Ok(None) => false,
        Err(e) => {
            warn!(group_id = %group_id, error = %e, "Leader lookup failed");
            false
        }
    }
}

fn note_step(
    name: &'static str,
    outcome: Result<CoordinationResult<()>, tokio::time::error::Elapsed>,
    first_timeout: &mut Option<&'static str>,
) {
    match outcome {
        Ok(Ok(())) => debug!(step = name, "Shutdown step finished"),
        Ok(Err(CoordinationError::ShutdownTimeout(inner))) => {
            warn!(step = name, inner, "Shutdown step timed out");
            first_timeout.get_or_insert(name);
        }
        Ok(Err(e)) => warn!(step = name, error = %e, "Shutdown step failed"),
        Err(_) => {
            warn!(step = name, "Shutdown step timed out");
            first_timeout.get_or_insert(name);
        }
    }
}
