//! Coordination store contract.
//!
//! Every higher component (membership, leader election, locks, the
//! store-backed snapshot store) is built on this key/value abstraction:
//!
//! - `ttl == Duration::ZERO` means the entry never expires
//! - an entry is expired once `expires_at <= now`; readers treat it as absent
//! - `compare_and_set` returns `Ok(false)` when the current value is absent,
//!   expired or unequal to `expected`. Losing a race is not an error
//! - `watch(prefix)` delivers PUT/DELETE/EXPIRE events for keys under the
//!   prefix, at least once, ordered per key
//!
//! Keys are hierarchical strings (`cluster:nodes/{id}`,
//! `cluster:raft/leader/{group}`, ...) so prefix scans and watches can
//! select one family of records.

mod memory;

pub use memory::InMemoryCoordinationStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use super::error::CoordinationResult;

/// Kind of change observed on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreEventKind {
    Put,
    Delete,
    Expire,
}

/// A change to one key in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// New value for `Put`, last known value for `Delete`/`Expire`.
    pub value: Option<Value>,
    pub at_ms: u64,
}

impl StoreEvent {
    /// Decode the carried value into `T`, if present and well-formed.
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.value
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Subscription to store changes under a key prefix.
pub struct StoreWatcher {
    prefix: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl StoreWatcher {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Wait for the next event under the prefix.
    ///
    /// Returns `None` once the store is dropped. A lagging subscriber skips
    /// the events it missed and keeps going.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "Store watcher lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Key/value store with TTL, compare-and-set, prefix scan and watch.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Unconditionally write `value` under `key`.
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> CoordinationResult<()>;

    /// Write only if `key` is absent or expired.
    async fn put_if_absent(&self, key: &str, value: Value, ttl: Duration)
    -> CoordinationResult<bool>;

    /// Read an unexpired value.
    async fn get(&self, key: &str) -> CoordinationResult<Option<Value>>;

    /// Remove `key`. Returns whether an unexpired entry was removed.
    async fn delete(&self, key: &str) -> CoordinationResult<bool>;

    /// Replace `expected` with `new`. `Ok(false)` when the current value is
    /// absent, expired or different.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        new: Value,
        ttl: Duration,
    ) -> CoordinationResult<bool>;

    /// All unexpired entries whose key starts with `prefix`, sorted by key.
    async fn scan(&self, prefix: &str) -> CoordinationResult<Vec<(String, Value)>>;

    /// Subscribe to changes under `prefix`.
    fn watch(&self, prefix: &str) -> StoreWatcher;
}

/// Typed convenience layer over [`CoordinationStore`].
#[async_trait]
pub trait TypedStoreExt: CoordinationStore {
    async fn put_as<T>(&self, key: &str, value: &T, ttl: Duration) -> CoordinationResult<()>
    where
        T: Serialize + Sync,
    {
        self.put(key, serde_json::to_value(value)?, ttl).await
    }

    async fn put_if_absent_as<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CoordinationResult<bool>
    where
        T: Serialize + Sync,
    {
        self.put_if_absent(key, serde_json::to_value(value)?, ttl)
            .await
    }

    async fn get_as<T>(&self, key: &str) -> CoordinationResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set_as<T>(
        &self,
        key: &str,
        expected: &T,
        new: &T,
        ttl: Duration,
    ) -> CoordinationResult<bool>
    where
        T: Serialize + Sync,
    {
        let expected = serde_json::to_value(expected)?;
        self.compare_and_set(key, &expected, serde_json::to_value(new)?, ttl)
            .await
    }

    /// Decode every entry under `prefix`. Entries that fail to decode are
    /// skipped with a warning.
    async fn scan_as<T>(&self, prefix: &str) -> CoordinationResult<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send,
    {
        let entries = self.scan(prefix).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_value(value) {
                Ok(decoded) => out.push((key, decoded)),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable store entry"),
            }
        }
        Ok(out)
    }
}

impl<S: CoordinationStore + ?Sized> TypedStoreExt for S {}
