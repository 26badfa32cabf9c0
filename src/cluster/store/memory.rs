//! In-memory coordination store.
//!
//! Reference implementation of [`CoordinationStore`] used for single-node
//! deployments and tests. Expiry is lazy: readers drop expired entries as
//! they find them, and [`InMemoryCoordinationStore::purge_expired`] sweeps
//! the rest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{CoordinationStore, StoreEvent, StoreEventKind, StoreWatcher};
use crate::cluster::clock::{Clock, SystemClock, expiry_for};
use crate::cluster::error::CoordinationResult;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// DashMap-backed store with a broadcast change feed.
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    entries: DashMap<String, StoredEntry>,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            clock,
        }
    }

    /// Remove every expired entry, emitting an `Expire` event for each.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.expire_key(&key, now) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Purged expired store entries");
        }
        removed
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire_key(&self, key: &str, now: u64) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                let value = occupied.get().value.clone();
                self.emit(StoreEventKind::Expire, occupied.key().clone(), Some(value), now);
                occupied.remove();
                true
            }
            _ => false,
        }
    }

    /// Events are sent while the key's entry guard is held so that, per
    /// key, subscribers see changes in the order they were stored.
    fn emit(&self, kind: StoreEventKind, key: String, value: Option<Value>, at_ms: u64) {
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent {
            kind,
            key,
            value,
            at_ms,
        });
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> CoordinationResult<()> {
        let now = self.clock.now_ms();
        let _guard = self.entries.entry(key.to_string()).insert(StoredEntry {
            value: value.clone(),
            expires_at_ms: expiry_for(now, ttl),
        });
        self.emit(StoreEventKind::Put, key.to_string(), Some(value), now);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let now = self.clock.now_ms();
        let fresh = StoredEntry {
            value: value.clone(),
            expires_at_ms: expiry_for(now, ttl),
        };

        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let previous = std::mem::replace(occupied.get_mut(), fresh);
                    self.emit(StoreEventKind::Expire, key.to_string(), Some(previous.value), now);
                    self.emit(StoreEventKind::Put, key.to_string(), Some(value), now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                let _guard = vacant.insert(fresh);
                self.emit(StoreEventKind::Put, key.to_string(), Some(value), now);
                true
            }
        };
        Ok(written)
    }

    async fn get(&self, key: &str) -> CoordinationResult<Option<Value>> {
        let now = self.clock.now_ms();
        let (value, expired) = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };
        if expired {
            self.expire_key(key, now);
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> CoordinationResult<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let expired = occupied.get().is_expired(now);
                let kind = if expired {
                    StoreEventKind::Expire
                } else {
                    StoreEventKind::Delete
                };
                let value = occupied.get().value.clone();
                self.emit(kind, key.to_string(), Some(value), now);
                occupied.remove();
                Ok(!expired)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        new: Value,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let now = self.clock.now_ms();
        let swapped = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) && entry.value == *expected => {
                entry.value = new.clone();
                entry.expires_at_ms = expiry_for(now, ttl);
                self.emit(StoreEventKind::Put, key.to_string(), Some(new), now);
                true
            }
            _ => false,
        };
        Ok(swapped)
    }

    async fn scan(&self, prefix: &str) -> CoordinationResult<Vec<(String, Value)>> {
        let now = self.clock.now_ms();
        let mut out: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn watch(&self, prefix: &str) -> StoreWatcher {
        StoreWatcher::new(prefix, self.events.subscribe())
    }
}
