//! Leader bookkeeping for Kafka consumer-group mode.
//!
//! Kafka's group protocol has already decided who owns what. This service
//! only records that decision in the common [`LeaderInfo`] shape so the
//! processing guard can read it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{LeaderElectionMode, LeaderElectionService, LeaderInfo, LeaderWatcher, validate_acquire};
use crate::cluster::clock::Clock;
use crate::cluster::error::CoordinationResult;
use crate::cluster::metrics;

const CHANNEL_CAPACITY: usize = 128;

pub struct KafkaLeaderElectionService {
    leaders: DashMap<String, LeaderInfo>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<LeaderInfo>,
}

impl KafkaLeaderElectionService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            leaders: DashMap::new(),
            clock,
            changes,
        }
    }
}

#[async_trait]
impl LeaderElectionService for KafkaLeaderElectionService {
    fn mode(&self) -> LeaderElectionMode {
        LeaderElectionMode::Kafka
    }

    /// Always succeeds: the caller was handed ownership by the group protocol.
    async fn try_acquire_leader(
        &self,
        group_id: &str,
        node_id: &str,
        mode: LeaderElectionMode,
        lease: Duration,
    ) -> CoordinationResult<Option<LeaderInfo>> {
        validate_acquire(group_id, node_id, lease)?;
        let now = self.clock.now_ms();

        let info = {
            let mut entry = self
                .leaders
                .entry(group_id.to_string())
                .or_insert_with(|| LeaderInfo {
                    group_id: group_id.to_string(),
                    leader_node_id: node_id.to_string(),
                    mode,
                    term: 0,
                    elected_at_ms: now,
                    lease_expires_at_ms: now,
                });
            let record = entry.value_mut();
            record.term += 1;
            record.leader_node_id = node_id.to_string();
            record.mode = mode;
            record.elected_at_ms = now;
            record.lease_expires_at_ms = now.saturating_add(lease.as_millis() as u64);
            record.clone()
        };

        metrics::record_leader_acquisition(mode.as_str(), true);
        info!(group_id, node_id, term = info.term, "Kafka-assigned leadership recorded");
        let _ = self.changes.send(info.clone());
        Ok(Some(info))
    }

    async fn release(&self, group_id: &str, node_id: &str) -> CoordinationResult<bool> {
        let removed = self
            .leaders
            .remove_if(group_id, |_, info| info.is_held_by(node_id))
            .is_some();
        if removed {
            info!(group_id, node_id, "Kafka-assigned leadership released");
        }
        Ok(removed)
    }

    async fn get_leader(&self, group_id: &str) -> CoordinationResult<Option<LeaderInfo>> {
        let now = self.clock.now_ms();
        if self
            .leaders
            .remove_if(group_id, |_, info| info.is_expired(now))
            .is_some()
        {
            return Ok(None);
        }
        Ok(self.leaders.get(group_id).map(|e| e.value().clone()))
    }

    fn watch(&self, group_id: &str) -> LeaderWatcher {
        let rx = self.changes.subscribe();
        let group = group_id.to_string();

        let stream = futures::stream::unfold((rx, group), |(mut rx, group)| async move {
            loop {
                match rx.recv().await {
                    Ok(info) if info.group_id == group => return Some((info, (rx, group))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(group_id = %group, skipped, "Leader watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        LeaderWatcher::new(group_id, stream.boxed())
    }
}
