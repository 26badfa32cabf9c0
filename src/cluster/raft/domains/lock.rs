//! Lock domain for the replicated state machine.
//!
//! Lease arithmetic uses the command's `timestamp_ms`, never the local
//! clock, so every replica reaches the same decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::lock::LockRecord;
use crate::cluster::raft::commands::{CommandResponse, LockCommand, ReleaseLockCommand};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDomainState {
    locks: BTreeMap<String, LockRecord>,
}

impl LockDomainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, cmd: &LockCommand) -> CommandResponse {
        let now = cmd.timestamp_ms;
        if let Some(current) = self.locks.get(&cmd.name)
            && !current.is_expired(now)
            && !current.is_owned_by(&cmd.owner_node_id)
        {
            return CommandResponse::LockRejected {
                name: cmd.name.clone(),
                holder: current.owner_node_id.clone(),
            };
        }

        let record = LockRecord {
            name: cmd.name.clone(),
            owner_node_id: cmd.owner_node_id.clone(),
            lease_until_ms: now.saturating_add(cmd.lease_millis),
            metadata: cmd.metadata.clone(),
        };
        self.locks.insert(cmd.name.clone(), record.clone());
        CommandResponse::LockAcquired(record)
    }

    pub fn release(&mut self, cmd: &ReleaseLockCommand) -> CommandResponse {
        let held = self.locks.get(&cmd.name).is_some_and(|l| {
            l.is_owned_by(&cmd.owner_node_id) && !l.is_expired(cmd.timestamp_ms)
        });
        if held {
            self.locks.remove(&cmd.name);
            CommandResponse::LockReleased {
                name: cmd.name.clone(),
            }
        } else {
            CommandResponse::LockNotHeld {
                name: cmd.name.clone(),
            }
        }
    }

    /// Unexpired lock `name` at `now_ms`.
    pub fn get(&self, name: &str, now_ms: u64) -> Option<&LockRecord> {
        self.locks.get(name).filter(|l| !l.is_expired(now_ms))
    }

    /// Every lock unexpired at `now_ms`.
    pub fn snapshot(&self, now_ms: u64) -> BTreeMap<String, LockRecord> {
        self.locks
            .iter()
            .filter(|(_, l)| !l.is_expired(now_ms))
            .map(|(k, l)| (k.clone(), l.clone()))
            .collect()
    }

    pub fn restore(&mut self, locks: BTreeMap<String, LockRecord>) {
        self.locks = locks;
    }

    /// Number of records, expired ones included.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(owner: &str, at: u64) -> LockCommand {
        LockCommand {
            name: "lock-1".into(),
            owner_node_id: owner.into(),
            lease_millis: 30_000,
            metadata: BTreeMap::new(),
            timestamp_ms: at,
        }
    }

    fn release(owner: &str, at: u64) -> ReleaseLockCommand {
        ReleaseLockCommand {
            name: "lock-1".into(),
            owner_node_id: owner.into(),
            timestamp_ms: at,
        }
    }

    #[test]
    fn test_acquire_conflict_and_expiry() {
        let mut state = LockDomainState::new();
        assert!(matches!(state.acquire(&lock("node-1", 0)), CommandResponse::LockAcquired(_)));

        match state.acquire(&lock("node-2", 10_000)) {
            CommandResponse::LockRejected { holder, .. } => assert_eq!(holder, "node-1"),
            other => panic!("unexpected {other:?}"),
        }

        match state.acquire(&lock("node-2", 30_000)) {
            CommandResponse::LockAcquired(record) => {
                assert_eq!(record.owner_node_id, "node-2");
                assert_eq!(record.lease_until_ms, 60_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_owner_reacquire_extends() {
        let mut state = LockDomainState::new();
        state.acquire(&lock("node-1", 0));
        state.acquire(&lock("node-1", 20_000));
        assert_eq!(state.get("lock-1", 40_000).unwrap().lease_until_ms, 50_000);
    }

    #[test]
    fn test_release_rules() {
        let mut state = LockDomainState::new();
        state.acquire(&lock("node-1", 0));

        assert!(matches!(state.release(&release("node-2", 1)), CommandResponse::LockNotHeld { .. }));
        assert!(matches!(state.release(&release("node-1", 1)), CommandResponse::LockReleased { .. }));
        assert!(state.is_empty());

        state.acquire(&lock("node-1", 0));
        assert!(matches!(
            state.release(&release("node-1", 30_000)),
            CommandResponse::LockNotHeld { .. }
        ));
    }

    #[test]
    fn test_snapshot_filters_expired() {
        let mut state = LockDomainState::new();
        state.acquire(&lock("node-1", 0));
        assert_eq!(state.snapshot(29_999).len(), 1);
        assert!(state.snapshot(30_000).is_empty());
        assert!(state.get("lock-1", 30_000).is_none());
        assert_eq!(state.len(), 1);
    }
}
