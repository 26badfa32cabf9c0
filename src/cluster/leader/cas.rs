//! Store-backed leader election.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{LeaderElectionMode, LeaderElectionService, LeaderInfo, LeaderWatcher, validate_acquire};
use crate::cluster::clock::Clock;
use crate::cluster::error::CoordinationResult;
use crate::cluster::metrics;
use crate::cluster::store::{CoordinationStore, StoreEventKind, TypedStoreExt};

/// Key prefix for store-elected leaders.
pub const LEADER_PREFIX: &str = "cluster:leader/";
/// Key prefix used when leadership records mirror the replicated groups.
pub const RAFT_LEADER_PREFIX: &str = "cluster:raft/leader/";

/// Leader election by compare-and-set on `{prefix}{groupId}`.
///
/// Records are stored without a store TTL: the lease lives in the record and
/// is checked on every read. Keeping the record after expiry or release is
/// what lets the next acquisition continue the term sequence instead of
/// restarting at 1.
pub struct CasLeaderElectionService {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl CasLeaderElectionService {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_prefix(store, clock, LEADER_PREFIX)
    }

    pub fn with_prefix(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
        }
    }

    fn key(&self, group_id: &str) -> String {
        format!("{}{}", self.prefix, group_id)
    }
}

#[async_trait]
impl LeaderElectionService for CasLeaderElectionService {
    fn mode(&self) -> LeaderElectionMode {
        LeaderElectionMode::Raft
    }

    async fn try_acquire_leader(
        &self,
        group_id: &str,
        node_id: &str,
        mode: LeaderElectionMode,
        lease: Duration,
    ) -> CoordinationResult<Option<LeaderInfo>> {
        validate_acquire(group_id, node_id, lease)?;

        let key = self.key(group_id);
        let now = self.clock.now_ms();
        let desired = |term: u64| LeaderInfo {
            group_id: group_id.to_string(),
            leader_node_id: node_id.to_string(),
            mode,
            term,
            elected_at_ms: now,
            lease_expires_at_ms: now.saturating_add(lease.as_millis() as u64),
        };

        let acquired = match self.store.get_as::<LeaderInfo>(&key).await? {
            None => {
                let record = desired(1);
                self.store
                    .put_if_absent_as(&key, &record, Duration::ZERO)
                    .await?
                    .then_some(record)
            }
            Some(current) if current.is_expired(now) || current.is_held_by(node_id) => {
                let record = desired(current.term + 1);
                self.store
                    .compare_and_set_as(&key, &current, &record, Duration::ZERO)
                    .await?
                    .then_some(record)
            }
            Some(current) => {
                debug!(
                    group_id,
                    node_id,
                    leader = %current.leader_node_id,
                    term = current.term,
                    "Leadership held by another node"
                );
                None
            }
        };

        metrics::record_leader_acquisition(mode.as_str(), acquired.is_some());
        if let Some(info) = &acquired {
            info!(group_id, node_id, term = info.term, mode = %mode, "Leadership acquired");
        }
        Ok(acquired)
    }

    async fn release(&self, group_id: &str, node_id: &str) -> CoordinationResult<bool> {
        let key = self.key(group_id);
        let now = self.clock.now_ms();
        let Some(current) = self.store.get_as::<LeaderInfo>(&key).await? else {
            return Ok(false);
        };
        if !current.is_held_by(node_id) || current.is_expired(now) {
            return Ok(false);
        }

        // keep the record as an expired tombstone so the term lineage survives
        let released = LeaderInfo {
            lease_expires_at_ms: now,
            ..current.clone()
        };
        let swapped = self
            .store
            .compare_and_set_as(&key, &current, &released, Duration::ZERO)
            .await?;
        if swapped {
            info!(group_id, node_id, term = current.term, "Leadership released");
        }
        Ok(swapped)
    }

    async fn get_leader(&self, group_id: &str) -> CoordinationResult<Option<LeaderInfo>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get_as::<LeaderInfo>(&self.key(group_id))
            .await?
            .filter(|info| !info.is_expired(now)))
    }

    fn watch(&self, group_id: &str) -> LeaderWatcher {
        let key = self.key(group_id);
        let watcher = self.store.watch(&key);
        let clock = self.clock.clone();

        let stream = futures::stream::unfold((watcher, key, clock), |(mut watcher, key, clock)| async move {
            loop {
                let event = watcher.recv().await?;
                if event.key != key || event.kind != StoreEventKind::Put {
                    continue;
                }
                match event.value_as::<LeaderInfo>() {
                    Some(info) if !info.is_expired(clock.now_ms()) => {
                        return Some((info, (watcher, key, clock)));
                    }
                    _ => continue,
                }
            }
        });
        LeaderWatcher::new(group_id, stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::clock::ManualClock;
    use crate::cluster::store::InMemoryCoordinationStore;

    const LEASE: Duration = Duration::from_secs(30);

    fn setup() -> (Arc<ManualClock>, Arc<CasLeaderElectionService>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        (clock.clone(), Arc::new(CasLeaderElectionService::new(store, clock)))
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    #[tokio::test]
    async fn test_first_acquire_term_one() {
        let (_clock, election) = setup();
        let info = election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.term, 1);
        assert_eq!(info.lease_expires_at_ms, 31_000);
    }

    #[tokio::test]
    async fn test_foreign_unexpired_leader_blocks() {
        let (_clock, election) = setup();
        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        let second = election
            .try_acquire_leader("g1", "node-2", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_bumps_term() {
        let (clock, election) = setup();
        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        let renewed = election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.term, 2);
        assert_eq!(renewed.lease_expires_at_ms, 41_000);
    }

    #[tokio::test]
    async fn test_takeover_after_expiry_continues_terms() {
        let (clock, election) = setup();
        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));

        assert!(election.get_leader("g1").await.unwrap().is_none());
        let info = election
            .try_acquire_leader("g1", "node-2", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.leader_node_id, "node-2");
        assert_eq!(info.term, 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (_clock, election) = setup();
        let a = {
            let e = election.clone();
            tokio::spawn(async move {
                e.try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
                    .await
            })
        };
        let b = {
            let e = election.clone();
            tokio::spawn(async move {
                e.try_acquire_leader("g1", "node-2", LeaderElectionMode::Raft, LEASE)
                    .await
            })
        };
        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let winners: Vec<_> = results.iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].term, 1);
    }

    // ========================================================================
    // Release / read / watch
    // ========================================================================

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let (_clock, election) = setup();
        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();

        assert!(!election.release("g1", "node-2").await.unwrap());
        assert!(election.get_leader("g1").await.unwrap().is_some());

        assert!(election.release("g1", "node-1").await.unwrap());
        assert!(election.get_leader("g1").await.unwrap().is_none());
        assert!(!election.release("g1", "node-1").await.unwrap());

        let next = election
            .try_acquire_leader("g1", "node-2", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.term, 2);
    }

    #[tokio::test]
    async fn test_watch_streams_acquisitions() {
        let (_clock, election) = setup();
        let mut watcher = election.watch("g1");

        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        election
            .try_acquire_leader("g10", "node-9", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        election
            .try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();

        assert_eq!(watcher.recv().await.unwrap().term, 1);
        let second = watcher.recv().await.unwrap();
        assert_eq!(second.group_id, "g1");
        assert_eq!(second.term, 2);
    }

    #[tokio::test]
    async fn test_raft_prefix_isolated() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CoordinationStore> =
            Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        let plain = CasLeaderElectionService::new(store.clone(), clock.clone());
        let raft = CasLeaderElectionService::with_prefix(store.clone(), clock, RAFT_LEADER_PREFIX);

        raft.try_acquire_leader("g1", "node-1", LeaderElectionMode::Raft, LEASE)
            .await
            .unwrap();
        assert!(plain.get_leader("g1").await.unwrap().is_none());
        assert!(store.get("cluster:raft/leader/g1").await.unwrap().is_some());
    }
}
