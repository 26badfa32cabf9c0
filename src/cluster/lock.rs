//! Named distributed locks with leases.
//!
//! Same shape as leader election: acquire is a compare-and-set from
//! (absent | expired | mine) to a fresh lease, release deletes only for the
//! owner, and reads treat an expired record as absent. Records are written
//! with a store TTL equal to the lease so the store clears them on its own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::clock::Clock;
use super::error::{CoordinationError, CoordinationResult};
use super::metrics;
use super::store::{CoordinationStore, TypedStoreExt};

/// Key prefix for lock records.
pub const LOCKS_PREFIX: &str = "cluster:locks/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub name: String,
    pub owner_node_id: String,
    pub lease_until_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.lease_until_ms <= now_ms
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner_node_id == owner
    }

    /// Lease left at `now_ms`, zero once expired.
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.lease_until_ms.saturating_sub(now_ms))
    }
}

/// Mutual exclusion over named resources.
#[async_trait]
pub trait DistributedLockService: Send + Sync {
    /// Acquire `name` for `owner`. Returns `None` if someone else holds it.
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
        metadata: BTreeMap<String, String>,
    ) -> CoordinationResult<Option<LockRecord>>;

    /// Extend an unexpired lock held by `owner`, keeping its metadata.
    async fn refresh(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Option<LockRecord>>;

    async fn release(&self, name: &str, owner: &str) -> CoordinationResult<bool>;

    async fn get_lock(&self, name: &str) -> CoordinationResult<Option<LockRecord>>;

    /// Every unexpired lock, keyed by name.
    async fn snapshot_locks(&self) -> CoordinationResult<BTreeMap<String, LockRecord>>;

    /// Write back records from a snapshot. Expired records are skipped.
    async fn restore_locks(&self, locks: BTreeMap<String, LockRecord>) -> CoordinationResult<()>;
}

/// [`DistributedLockService`] over a [`CoordinationStore`].
pub struct StoreLockService {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
}

impl StoreLockService {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

fn lock_key(name: &str) -> String {
    format!("{LOCKS_PREFIX}{name}")
}

fn validate(name: &str, owner: &str, lease: Duration) -> CoordinationResult<()> {
    if name.trim().is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "lock name must not be empty".into(),
        ));
    }
    if owner.trim().is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "lock owner must not be empty".into(),
        ));
    }
    if lease.is_zero() {
        return Err(CoordinationError::InvalidArgument(
            "lock lease must be positive".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl DistributedLockService for StoreLockService {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
        metadata: BTreeMap<String, String>,
    ) -> CoordinationResult<Option<LockRecord>> {
        validate(name, owner, lease)?;

        let key = lock_key(name);
        let now = self.clock.now_ms();
        let desired = LockRecord {
            name: name.to_string(),
            owner_node_id: owner.to_string(),
            lease_until_ms: now.saturating_add(lease.as_millis() as u64),
            metadata,
        };

        let acquired = match self.store.get_as::<LockRecord>(&key).await? {
            None => self.store.put_if_absent_as(&key, &desired, lease).await?,
            Some(current) if current.is_expired(now) || current.is_owned_by(owner) => {
                self.store
                    .compare_and_set_as(&key, &current, &desired, lease)
                    .await?
            }
            Some(current) => {
                debug!(lock = name, owner, holder = %current.owner_node_id, "Lock held by another owner");
                false
            }
        };

        metrics::record_lock_operation("acquire", acquired);
        if acquired {
            info!(lock = name, owner, lease_until_ms = desired.lease_until_ms, "Lock acquired");
            Ok(Some(desired))
        } else {
            Ok(None)
        }
    }

    async fn refresh(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Option<LockRecord>> {
        validate(name, owner, lease)?;

        let key = lock_key(name);
        let now = self.clock.now_ms();
        let refreshed = match self.store.get_as::<LockRecord>(&key).await? {
            Some(current) if current.is_owned_by(owner) && !current.is_expired(now) => {
                let next = LockRecord {
                    lease_until_ms: now.saturating_add(lease.as_millis() as u64),
                    ..current.clone()
                };
                self.store
                    .compare_and_set_as(&key, &current, &next, lease)
                    .await?
                    .then_some(next)
            }
            _ => None,
        };

        metrics::record_lock_operation("refresh", refreshed.is_some());
        Ok(refreshed)
    }

    async fn release(&self, name: &str, owner: &str) -> CoordinationResult<bool> {
        let key = lock_key(name);
        let now = self.clock.now_ms();
        let released = match self.store.get_as::<LockRecord>(&key).await? {
            Some(current) if current.is_owned_by(owner) && !current.is_expired(now) => {
                self.store.delete(&key).await?
            }
            _ => false,
        };

        metrics::record_lock_operation("release", released);
        if released {
            info!(lock = name, owner, "Lock released");
        }
        Ok(released)
    }

    async fn get_lock(&self, name: &str) -> CoordinationResult<Option<LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get_as::<LockRecord>(&lock_key(name))
            .await?
            .filter(|lock| !lock.is_expired(now)))
    }

    async fn snapshot_locks(&self) -> CoordinationResult<BTreeMap<String, LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .scan_as::<LockRecord>(LOCKS_PREFIX)
            .await?
            .into_iter()
            .filter(|(_, lock)| !lock.is_expired(now))
            .map(|(_, lock)| (lock.name.clone(), lock))
            .collect())
    }

    async fn restore_locks(&self, locks: BTreeMap<String, LockRecord>) -> CoordinationResult<()> {
        let now = self.clock.now_ms();
        let mut restored = 0usize;
        for (name, lock) in locks {
            if lock.is_expired(now) {
                debug!(lock = %name, "Skipping expired lock on restore");
                continue;
            }
            self.store
                .put_as(&lock_key(&name), &lock, lock.remaining(now))
                .await?;
            restored += 1;
        }
        info!(restored, "Locks restored");
        Ok(())
    }
}
