//! Point-in-time dumps of replicated state and where they are kept.
//!
//! A [`ClusterSnapshot`] is one JSON document per group holding every lock,
//! assignment and key assignment as of the last applied log entry. It is
//! persisted through a [`SnapshotStore`] chosen by configuration:
//!
//! | Kind | Backend | Location |
//! |------|---------|----------|
//! | `file` | [`FileSnapshotStore`] | `{dir}/{groupId}.snapshot.json` |
//! | `db`, `repository`, `kafka-ktable` | [`StoreSnapshotStore`] | `cluster:raft/snapshots/{groupId}` |
//! | `object-store` | [`ObjectStoreSnapshotStore`] | `{prefix}/{groupId}.snapshot.json` |
//!
//! # Legacy shapes
//!
//! Older snapshots stored key assignments as partition → key → record and
//! assignments with a flat `equipmentIds` list. [`ClusterSnapshot::from_json`]
//! rewrites both into the current shape before deserializing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::config::{RaftServerConfig, SnapshotStoreKind};
use crate::cluster::assignment::{Assignment, DEFAULT_AFFINITY_KIND, KeyAssignmentMap};
use crate::cluster::error::{CoordinationError, CoordinationResult};
use crate::cluster::lock::LockRecord;
use crate::cluster::store::{CoordinationStore, TypedStoreExt};

/// Current snapshot layout.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Key prefix for snapshots kept in the coordination store.
pub const SNAPSHOT_KEY_PREFIX: &str = "cluster:raft/snapshots/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub format_version: u32,
    pub group_id: String,
    /// Term of the last applied entry, `-1` when nothing was applied.
    pub term: i64,
    /// Index of the last applied entry, `-1` when nothing was applied.
    pub index: i64,
    pub taken_at_ms: u64,
    /// Newest command timestamp applied; locks expired at it are left out.
    #[serde(default)]
    pub applied_at_ms: u64,
    #[serde(default)]
    pub locks: BTreeMap<String, LockRecord>,
    #[serde(default)]
    pub assignments: BTreeMap<i32, Assignment>,
    #[serde(default)]
    pub key_assignments: KeyAssignmentMap,
    /// Consensus membership at `index`, opaque to the state machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<Value>,
    /// Consensus log id at `index`, opaque to the state machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<Value>,
}

impl ClusterSnapshot {
    /// Empty snapshot for `group_id` at "nothing applied".
    pub fn empty(group_id: impl Into<String>, taken_at_ms: u64) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            group_id: group_id.into(),
            term: -1,
            index: -1,
            taken_at_ms,
            applied_at_ms: 0,
            locks: BTreeMap::new(),
            assignments: BTreeMap::new(),
            key_assignments: KeyAssignmentMap::new(),
            membership: None,
            log_id: None,
        }
    }

    /// `(term, index)` of the last applied entry, if any.
    pub fn position(&self) -> Option<(u64, u64)> {
        if self.term >= 0 && self.index >= 0 {
            Some((self.term as u64, self.index as u64))
        } else {
            None
        }
    }

    pub fn to_json(&self) -> CoordinationResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a snapshot, migrating legacy shapes first.
    pub fn from_json(bytes: &[u8]) -> CoordinationResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> CoordinationResult<Self> {
        if normalize_legacy(&mut value) {
            info!("Migrated legacy snapshot layout");
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Rewrite legacy layouts in place. Returns whether anything changed.
pub fn normalize_legacy(snapshot: &mut Value) -> bool {
    let mut changed = false;

    if let Some(partitions) = snapshot
        .get_mut("keyAssignments")
        .and_then(Value::as_object_mut)
    {
        for by_kind in partitions.values_mut() {
            if let Some(map) = by_kind.as_object_mut() {
                changed |= nest_by_kind(map);
            }
        }
    }

    if let Some(assignments) = snapshot
        .get_mut("assignments")
        .and_then(Value::as_object_mut)
    {
        for assignment in assignments.values_mut() {
            if let Some(fields) = assignment.as_object_mut() {
                changed |= lift_equipment_ids(fields);
            }
        }
    }

    changed
}

/// A legacy entry is a record (it has a string `appId`) sitting where the
/// current layout expects a key → record map.
fn is_key_assignment_record(value: &Value) -> bool {
    value.get("appId").is_some_and(Value::is_string)
}

fn nest_by_kind(partition: &mut Map<String, Value>) -> bool {
    if !partition.values().any(is_key_assignment_record) {
        return false;
    }

    let entries = std::mem::take(partition);
    for (key, entry) in entries {
        if !is_key_assignment_record(&entry) {
            partition.insert(key, entry);
            continue;
        }
        let mut record = entry;
        let kind = record
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_AFFINITY_KIND)
            .to_string();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("kind".into(), Value::String(kind.clone()));
            fields
                .entry("key")
                .or_insert_with(|| Value::String(key.clone()));
        }
        if let Some(by_key) = partition
            .entry(kind)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            by_key.insert(key, record);
        }
    }
    true
}

fn lift_equipment_ids(assignment: &mut Map<String, Value>) -> bool {
    let Some(ids) = assignment.remove("equipmentIds") else {
        return false;
    };
    let has_affinities = assignment
        .get("affinities")
        .and_then(Value::as_object)
        .is_some_and(|a| !a.is_empty());
    if !has_affinities && ids.as_array().is_some_and(|a| !a.is_empty()) {
        let mut affinities = Map::new();
        affinities.insert(DEFAULT_AFFINITY_KIND.to_string(), ids);
        assignment.insert("affinities".into(), Value::Object(affinities));
    }
    true
}

/// Durable home for the latest snapshot of each group.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot for `snapshot.group_id`.
    async fn persist(&self, snapshot: &ClusterSnapshot) -> CoordinationResult<()>;

    /// Latest snapshot for `group_id`, `None` on a clean start.
    async fn load_latest(&self, group_id: &str) -> CoordinationResult<Option<ClusterSnapshot>>;

    fn kind(&self) -> &'static str;
}

// ============================================================================
// File
// ============================================================================

/// One JSON file per group, replaced atomically via rename.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, group_id: &str) -> PathBuf {
        self.dir.join(format!("{group_id}.snapshot.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn persist(&self, snapshot: &ClusterSnapshot) -> CoordinationResult<()> {
        let bytes = snapshot.to_json()?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.path_for(&snapshot.group_id);
        let temp = self
            .dir
            .join(format!(".{}.snapshot.json.tmp", snapshot.group_id));
        tokio::fs::write(&temp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(path = %target.display(), size_bytes = bytes.len(), "Wrote snapshot file");
        Ok(())
    }

    async fn load_latest(&self, group_id: &str) -> CoordinationResult<Option<ClusterSnapshot>> {
        let path = self.path_for(group_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => ClusterSnapshot::from_json(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// Coordination store
// ============================================================================

/// Snapshots kept as values in the coordination store, without expiry.
pub struct StoreSnapshotStore {
    store: Arc<dyn CoordinationStore>,
}

impl StoreSnapshotStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotStore for StoreSnapshotStore {
    async fn persist(&self, snapshot: &ClusterSnapshot) -> CoordinationResult<()> {
        let key = format!("{SNAPSHOT_KEY_PREFIX}{}", snapshot.group_id);
        self.store.put_as(&key, snapshot, Duration::ZERO).await
    }

    async fn load_latest(&self, group_id: &str) -> CoordinationResult<Option<ClusterSnapshot>> {
        let key = format!("{SNAPSHOT_KEY_PREFIX}{group_id}");
        match self.store.get(&key).await? {
            Some(value) => ClusterSnapshot::from_value(value).map(Some),
            None => Ok(None),
        }
    }

    fn kind(&self) -> &'static str {
        "store"
    }
}

// ============================================================================
// Object store
// ============================================================================

/// Snapshots kept in an object store (local, S3, GCS or Azure).
pub struct ObjectStoreSnapshotStore {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreSnapshotStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            object_store,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, group_id: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{group_id}.snapshot.json", self.prefix))
    }
}

#[async_trait]
impl SnapshotStore for ObjectStoreSnapshotStore {
    async fn persist(&self, snapshot: &ClusterSnapshot) -> CoordinationResult<()> {
        let bytes = snapshot.to_json()?;
        let path = self.path_for(&snapshot.group_id);
        let size = bytes.len();
        self.object_store.put(&path, bytes.into()).await?;
        debug!(path = %path, size_bytes = size, "Wrote snapshot object");
        Ok(())
    }

    async fn load_latest(&self, group_id: &str) -> CoordinationResult<Option<ClusterSnapshot>> {
        let path = self.path_for(group_id);
        let result = match self.object_store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        ClusterSnapshot::from_json(&bytes).map(Some)
    }

    fn kind(&self) -> &'static str {
        "object-store"
    }
}

/// Pick the snapshot backend named by `config`.
///
/// Store-backed kinds need `coordination_store`; `object-store` needs
/// `object_store`.
pub fn snapshot_store_for_config(
    config: &RaftServerConfig,
    coordination_store: Option<Arc<dyn CoordinationStore>>,
    object_store: Option<Arc<dyn ObjectStore>>,
) -> CoordinationResult<Arc<dyn SnapshotStore>> {
    match config.snapshot_store {
        SnapshotStoreKind::File => Ok(Arc::new(FileSnapshotStore::new(
            config.data_dir.join("snapshots"),
        ))),
        SnapshotStoreKind::Db | SnapshotStoreKind::Repository | SnapshotStoreKind::KafkaKtable => {
            match coordination_store {
                Some(store) => {
                    if config.snapshot_store != SnapshotStoreKind::Db {
                        warn!(
                            kind = %config.snapshot_store,
                            "Snapshot kind is served by the coordination store"
                        );
                    }
                    Ok(Arc::new(StoreSnapshotStore::new(store)))
                }
                None => Err(CoordinationError::Config(format!(
                    "snapshot store '{}' requires a coordination store",
                    config.snapshot_store
                ))),
            }
        }
        SnapshotStoreKind::ObjectStore => match object_store {
            Some(object_store) => Ok(Arc::new(ObjectStoreSnapshotStore::new(
                object_store,
                config.snapshot_prefix.clone(),
            ))),
            None => Err(CoordinationError::Config(
                "snapshot store 'object-store' requires an object store".into(),
            )),
        },
    }
}
