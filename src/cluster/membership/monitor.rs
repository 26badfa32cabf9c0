//! Background heartbeat and timeout detection for the local node.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{ClusterNode, MembershipService, NodeRecord};
use crate::cluster::background_tasks::BackgroundTaskRegistry;
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::retry::{retry_retriable, store_policy};

/// Drives heartbeats for one node and runs timeout detection.
///
/// Each node runs detection; the compare-and-set in
/// [`MembershipService::detect_timeouts`] keeps concurrent detectors from
/// clobbering each other.
pub struct HeartbeatMonitor {
    membership: Arc<MembershipService>,
    node: ClusterNode,
    tasks: BackgroundTaskRegistry,
    started: bool,
}

impl HeartbeatMonitor {
    pub fn new(membership: Arc<MembershipService>, node: ClusterNode) -> Self {
        Self {
            membership,
            node,
            tasks: BackgroundTaskRegistry::new(),
            started: false,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Join the cluster and start the heartbeat and detection loops.
    pub async fn start(&mut self) -> CoordinationResult<NodeRecord> {
        if self.tasks.is_shutting_down() {
            self.tasks = BackgroundTaskRegistry::new();
        }
        let membership = self.membership.clone();
        let node = self.node.clone();
        let record = retry_retriable("membership_join", store_policy(), || {
            let membership = membership.clone();
            let node = node.clone();
            async move { membership.join(node).await }
        })
        .await?;

        let config = *self.membership.config();

        let membership = self.membership.clone();
        let node_id = self.node.node_id.clone();
        self.tasks
            .spawn_periodic("membership-heartbeat", config.heartbeat_interval, move |tick| {
                let membership = membership.clone();
                let node_id = node_id.clone();
                async move {
                    // tick 0 fires immediately and join already stamped us
                    if tick == 0 {
                        return;
                    }
                    if let Err(e) = membership.heartbeat(&node_id).await {
                        warn!(node_id = %node_id, error = %e, "Heartbeat failed");
                    }
                }
            });

        let membership = self.membership.clone();
        self.tasks.spawn_periodic(
            "membership-detector",
            config.detection_interval(),
            move |_| {
                let membership = membership.clone();
                async move {
                    if let Err(e) = membership.detect_timeouts().await {
                        warn!(error = %e, "Timeout detection failed");
                    }
                }
            },
        );

        self.started = true;
        info!(
            node_id = %self.node.node_id,
            interval_ms = config.heartbeat_interval.as_millis() as u64,
            timeout_ms = config.heartbeat_timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );
        Ok(record)
    }

    /// Stop the loops and leave the cluster, bounded by `timeout` overall.
    pub async fn stop(&mut self, timeout: Duration) -> CoordinationResult<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        let deadline = tokio::time::Instant::now() + timeout;
        let report = self.tasks.shutdown_all_with_timeout(timeout).await;
        if !report.aborted.is_empty() {
            warn!(aborted = ?report.aborted, "Membership loops aborted at shutdown");
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, self.membership.leave(&self.node.node_id)).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::ShutdownTimeout("membership leave")),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.running_count()
    }
}
