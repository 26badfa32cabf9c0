//! Distributed locks replicated through the log.
//!
//! Lease deadlines are computed from the proposer's timestamp carried in
//! the command, so every replica agrees on when a lock expires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::commands::{CommandResponse, LockCommand, RaftCommand, ReleaseLockCommand};
use super::proposer::{CommandProposer, unexpected};
use super::state_machine::ClusterStateMachine;
use crate::cluster::clock::Clock;
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::lock::{DistributedLockService, LockRecord};
use crate::cluster::metrics;

pub struct RaftLockService {
    proposer: Arc<dyn CommandProposer>,
    state_machine: Arc<ClusterStateMachine>,
    clock: Arc<dyn Clock>,
}

impl RaftLockService {
    pub fn new(proposer: Arc<dyn CommandProposer>, state_machine: Arc<ClusterStateMachine>) -> Self {
        let clock = state_machine.clock();
        Self {
            proposer,
            state_machine,
            clock,
        }
    }

    async fn propose_lock(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
        metadata: BTreeMap<String, String>,
    ) -> CoordinationResult<Option<LockRecord>> {
        let command = RaftCommand::Lock(LockCommand {
            name: name.to_string(),
            owner_node_id: owner.to_string(),
            lease_millis: lease.as_millis() as u64,
            metadata,
            timestamp_ms: self.clock.now_ms(),
        });
        match self.proposer.propose(command).await? {
            CommandResponse::LockAcquired(record) => Ok(Some(record)),
            CommandResponse::LockRejected { holder, .. } => {
                debug!(lock = name, owner, holder = %holder, "Lock held elsewhere");
                Ok(None)
            }
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl DistributedLockService for RaftLockService {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
        metadata: BTreeMap<String, String>,
    ) -> CoordinationResult<Option<LockRecord>> {
        let acquired = self.propose_lock(name, owner, lease, metadata).await?;
        metrics::record_lock_operation("acquire", acquired.is_some());
        if let Some(record) = &acquired {
            info!(lock = name, owner, lease_until_ms = record.lease_until_ms, "Lock acquired");
        }
        Ok(acquired)
    }

    async fn refresh(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Option<LockRecord>> {
        let Some(current) = self.state_machine.get_lock(name).await else {
            metrics::record_lock_operation("refresh", false);
            return Ok(None);
        };
        if !current.is_owned_by(owner) {
            metrics::record_lock_operation("refresh", false);
            return Ok(None);
        }
        let refreshed = self
            .propose_lock(name, owner, lease, current.metadata)
            .await?;
        metrics::record_lock_operation("refresh", refreshed.is_some());
        Ok(refreshed)
    }

    async fn release(&self, name: &str, owner: &str) -> CoordinationResult<bool> {
        let command = RaftCommand::ReleaseLock(ReleaseLockCommand {
            name: name.to_string(),
            owner_node_id: owner.to_string(),
            timestamp_ms: self.clock.now_ms(),
        });
        let released = match self.proposer.propose(command).await? {
            CommandResponse::LockReleased { .. } => true,
            CommandResponse::LockNotHeld { .. } => false,
            other => return Err(unexpected(other)),
        };
        metrics::record_lock_operation("release", released);
        if released {
            info!(lock = name, owner, "Lock released");
        }
        Ok(released)
    }

    async fn get_lock(&self, name: &str) -> CoordinationResult<Option<LockRecord>> {
        Ok(self.state_machine.get_lock(name).await)
    }

    async fn snapshot_locks(&self) -> CoordinationResult<BTreeMap<String, LockRecord>> {
        Ok(self.state_machine.locks().await)
    }

    async fn restore_locks(&self, _locks: BTreeMap<String, LockRecord>) -> CoordinationResult<()> {
        Err(CoordinationError::InvalidArgument(
            "replicated locks are restored from state machine snapshots".into(),
        ))
    }
}
