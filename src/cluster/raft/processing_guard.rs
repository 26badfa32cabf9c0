//! Leader-only processing gate.
//!
//! The decision is advisory: leadership and safe mode can change right
//! after a check, so callers re-check before each unit of leader-affine
//! work. No lock is held between the decision and its use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use super::health::StateMachineMetrics;
use super::safe_mode::{ProcessingDecision, RebalanceSafeModeGuard};
use crate::cluster::error::CoordinationResult;
use crate::cluster::leader::LeaderElectionService;

pub struct LeaderProcessingGuard {
    leader_election: Arc<dyn LeaderElectionService>,
    group_id: String,
    node_id: String,
    safe_mode: Arc<RebalanceSafeModeGuard>,
    metrics: Arc<StateMachineMetrics>,
    last_allowed: AtomicBool,
}

impl LeaderProcessingGuard {
    pub fn new(
        leader_election: Arc<dyn LeaderElectionService>,
        group_id: impl Into<String>,
        node_id: impl Into<String>,
        safe_mode: Arc<RebalanceSafeModeGuard>,
        metrics: Arc<StateMachineMetrics>,
    ) -> Self {
        Self {
            leader_election,
            group_id: group_id.into(),
            node_id: node_id.into(),
            safe_mode,
            metrics,
            last_allowed: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Safe mode first, then "am I the current leader of the group".
    pub async fn allow_processing(&self) -> CoordinationResult<ProcessingDecision> {
        if self.safe_mode.is_safe_mode() {
            return Ok(ProcessingDecision::denied(format!(
                "safe-mode:{}",
                self.safe_mode.reason()
            )));
        }

        let leader = self.leader_election.get_leader(&self.group_id).await?;
        let leader_id = leader
            .as_ref()
            .map(|info| info.leader_node_id.as_str())
            .unwrap_or("");
        let allowed = leader_id == self.node_id;
        self.record(leader_id, allowed);

        Ok(if allowed {
            ProcessingDecision::allowed("leader")
        } else {
            ProcessingDecision::denied("not-leader")
        })
    }

    fn record(&self, leader_id: &str, allowed: bool) {
        self.metrics.update_leader(leader_id);
        let previous = self.last_allowed.swap(allowed, Ordering::SeqCst);
        if previous != allowed {
            info!(
                group_id = %self.group_id,
                allowed,
                leader = %leader_id,
                "Leader processing state changed"
            );
        }
    }
}
