//! # Version Store
//!
//! Versioned entity tables plus an append-only, hash-linked change history.
//!
//! Every local mutation goes through [`VersionStore::apply_change`], which
//! applies it to the tables, recomputes the version hash over the full state
//! of the versioned tables, appends a [`VersionRecord`] whose parent is the
//! previous version, and queues a [`SyncOperation`] for distribution. Remote
//! changes come in through [`VersionStore::replay`] and
//! [`VersionStore::catch_up`].
//!
//! All mutations, local and remote, serialize through one mutex. The state is
//! snapshotted as JSON after each mutation when the store is opened on disk.
//!
//! ## Version pointer
//!
//! The current version is a pointer, not a derived value. After catching up
//! with a peer or authority the pointer is overwritten with whatever version
//! that source reported as latest. Concurrent histories are not merged:
//! local versions that the source never saw fall off the chain that the
//! pointer names.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::protocol::{timestamp_format, NodeId};

/// One entity row: column name to value.
pub type Row = serde_json::Map<String, Value>;

const SNAPSHOT_FILE: &str = "version_store.json";

/// Tables covered by the version hash unless configured otherwise.
pub const DEFAULT_VERSIONED_TABLES: [&str; 3] = ["users", "files", "permissions"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        })
    }
}

/// The unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "operation_type")]
    pub operation: Operation,
    #[serde(rename = "table_name")]
    pub table: String,
    pub record_id: String,
    pub data: Row,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "peer_id")]
    pub origin_peer: NodeId,
}

/// A link in the version chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_hash: String,
    pub parent_hash: Option<String>,
    pub peer_id: NodeId,
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub is_snapshot: bool,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
}

impl VersionRecord {
    /// Whether both describe the same link: same state, same parent, same
    /// author, same moment. Equal hashes alone do not make equal records.
    pub fn same_record(&self, other: &VersionRecord) -> bool {
        self.version_hash == other.version_hash
            && self.parent_hash == other.parent_hash
            && self.peer_id == other.peer_id
            && self.timestamp == other.timestamp
    }
}

/// A local change waiting to be distributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: u64,
    #[serde(flatten)]
    pub change: ChangeRecord,
    pub is_applied: bool,
    pub version_hash: String,
}

/// Outcome of a replay. Failed records were skipped; the rest applied.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub failed: Vec<(usize, StoreError)>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Table-scoped access to the relational substrate the store versions.
pub trait TableStore {
    /// Fails if the id already exists.
    fn insert(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError>;

    /// Merges `fields` into an existing row. Fails if the id is missing.
    fn update(&mut self, table: &str, id: &str, fields: Row) -> Result<(), StoreError>;

    /// Deleting a missing row is a no-op.
    fn delete(&mut self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Every row of the table, id ascending.
    fn scan(&self, table: &str) -> Vec<(String, Row)>;

    fn get(&self, table: &str, id: &str) -> Option<Row>;
}

/// In-memory [`TableStore`], persisted as part of the store snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTables {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
}

impl TableStore for MemoryTables {
    fn insert(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError> {
        let rows = self.tables.entry(table.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(StoreError::DuplicateRecord {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        rows.insert(id.to_string(), row);
        Ok(())
    }

    fn update(&mut self, table: &str, id: &str, fields: Row) -> Result<(), StoreError> {
        let row = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| StoreError::RecordNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        row.extend(fields);
        Ok(())
    }

    fn delete(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        if let Some(rows) = self.tables.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    fn scan(&self, table: &str) -> Vec<(String, Row)> {
        self.tables
            .get(table)
            .map(|rows| rows.iter().map(|(id, row)| (id.clone(), row.clone())).collect())
            .unwrap_or_default()
    }

    fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables.get(table).and_then(|rows| rows.get(id)).cloned()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    tables: MemoryTables,
    history: Vec<VersionRecord>,
    outbox: Vec<SyncOperation>,
    current_version: Option<String>,
    next_operation_id: u64,
}

impl StoreState {
    /// Index of the first record after `version_hash`; 0 if it is unknown.
    fn position_after(&self, version_hash: Option<&str>) -> usize {
        version_hash
            .and_then(|hash| {
                self.history
                    .iter()
                    .rposition(|record| record.version_hash == hash)
            })
            .map(|index| index + 1)
            .unwrap_or(0)
    }
}

/// Versioned tables, change history and outbox behind a single writer.
///
/// Readers take a short lock on the committed state. Mutations are staged on
/// a copy, written to the snapshot and only then committed, so a failed
/// write leaves the store as it was.
#[derive(Clone)]
pub struct VersionStore {
    state: Arc<Mutex<StoreState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    peer_id: NodeId,
    versioned_tables: Arc<Vec<String>>,
    snapshot_path: Option<PathBuf>,
}

impl VersionStore {
    /// Opens (or creates) a store persisted under `dir`.
    pub async fn open(dir: &Path, peer_id: NodeId, versioned_tables: Vec<String>) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let snapshot_path = dir.join(SNAPSHOT_FILE);

        let state: StoreState = if tokio::fs::try_exists(&snapshot_path).await? {
            let data = tokio::fs::read(&snapshot_path).await?;
            serde_json::from_slice(&data)?
        } else {
            StoreState::default()
        };

        info!(
            "Opened version store at {} ({} versions, current {:?})",
            dir.display(),
            state.history.len(),
            state.current_version
        );

        Ok(Self::with_state(state, peer_id, versioned_tables, Some(snapshot_path)))
    }

    /// A store that lives only in memory.
    pub fn in_memory(peer_id: NodeId, versioned_tables: Vec<String>) -> Self {
        Self::with_state(StoreState::default(), peer_id, versioned_tables, None)
    }

    fn with_state(
        state: StoreState,
        peer_id: NodeId,
        versioned_tables: Vec<String>,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            peer_id,
            versioned_tables: Arc::new(versioned_tables),
            snapshot_path,
        }
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn versioned_tables(&self) -> &[String] {
        &self.versioned_tables
    }

    /// Applies a local mutation and records it as a new version.
    ///
    /// Nothing is recorded if the mutation or the snapshot write fails.
    pub async fn apply_change(
        &self,
        operation: Operation,
        table: &str,
        record_id: &str,
        data: Row,
    ) -> Result<VersionRecord, StoreError> {
        let record = self
            .mutate(|state| {
                self.apply_primitive(state, operation, table, record_id, data.clone())?;

                // Microseconds, the precision the authority keeps.
                let now = Utc::now().trunc_subsecs(6);
                let version_hash = self.compute_hash(&state.tables);
                let change = ChangeRecord {
                    operation,
                    table: table.to_string(),
                    record_id: record_id.to_string(),
                    data,
                    timestamp: now,
                    origin_peer: self.peer_id.clone(),
                };
                let record = VersionRecord {
                    version_hash: version_hash.clone(),
                    parent_hash: state.current_version.clone(),
                    peer_id: self.peer_id.clone(),
                    changes: vec![change.clone()],
                    is_snapshot: false,
                    timestamp: now,
                };

                let operation_id = state.next_operation_id;
                state.next_operation_id += 1;
                state.outbox.push(SyncOperation {
                    id: operation_id,
                    change,
                    is_applied: false,
                    version_hash: version_hash.clone(),
                });
                state.history.push(record.clone());
                state.current_version = Some(version_hash);
                Ok(record)
            })
            .await?;

        debug!(
            "{} {}/{} -> version {}",
            operation, table, record_id, record.version_hash
        );
        Ok(record)
    }

    /// The version pointer. `None` until the first change or catch-up.
    pub fn current_version_hash(&self) -> Option<String> {
        self.state.lock().current_version.clone()
    }

    /// Overwrites the version pointer.
    pub async fn set_current_version(&self, version_hash: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.current_version = Some(version_hash.to_string());
            Ok(())
        })
        .await
    }

    /// Hash of the current table contents, independent of the pointer.
    pub fn state_hash(&self) -> String {
        let state = self.state.lock();
        self.compute_hash(&state.tables)
    }

    /// Undistributed operations, oldest first.
    pub fn pending_changes(&self) -> Vec<SyncOperation> {
        let state = self.state.lock();
        let mut pending: Vec<SyncOperation> = state
            .outbox
            .iter()
            .filter(|op| !op.is_applied)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.change
                .timestamp
                .cmp(&b.change.timestamp)
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// Flags an operation as distributed. Returns false if the id is unknown.
    pub async fn mark_applied(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.mark_all_applied(&[id]).await? == 1)
    }

    /// Flags several operations with one snapshot write. Returns how many
    /// ids were known.
    pub async fn mark_all_applied(&self, ids: &[u64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.mutate(|state| {
            let mut marked = 0;
            for op in state.outbox.iter_mut().filter(|op| ids.contains(&op.id)) {
                op.is_applied = true;
                marked += 1;
            }
            Ok(marked)
        })
        .await
    }

    /// Applies remote changes in order.
    ///
    /// Not atomic: a record that fails is logged and skipped and the rest of
    /// the batch still applies. Replay neither moves the version pointer nor
    /// queues outbox entries.
    pub async fn replay(&self, changes: &[ChangeRecord]) -> Result<ReplayReport, StoreError> {
        self.mutate(|state| Ok(self.replay_locked(state, changes))).await
    }

    /// Replays the changes of every record the local history lacks, imports
    /// those records, and overwrites the pointer with `latest`.
    ///
    /// Records are matched on their full identity, not on the version hash
    /// alone: returning to an earlier state reproduces an earlier hash.
    pub async fn catch_up(&self, records: &[VersionRecord], latest: &str) -> Result<ReplayReport, StoreError> {
        let (report, previous) = self
            .mutate(|state| {
                let mut report = ReplayReport::default();
                for record in records {
                    if state.history.iter().any(|known| known.same_record(record)) {
                        continue;
                    }
                    let partial = self.replay_locked(state, &record.changes);
                    report.applied += partial.applied;
                    report.failed.extend(partial.failed);
                    state.history.push(record.clone());
                }
                let previous = state.current_version.replace(latest.to_string());
                Ok((report, previous))
            })
            .await?;

        if previous.as_deref() != Some(latest) {
            info!("Version pointer moved from {:?} to {}", previous, latest);
        }
        Ok(report)
    }

    pub fn history(&self) -> Vec<VersionRecord> {
        self.state.lock().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// The most recent record with this hash.
    pub fn version(&self, version_hash: &str) -> Option<VersionRecord> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .find(|record| record.version_hash == version_hash)
            .cloned()
    }

    /// The record an outbox operation was created with.
    pub fn record_of(&self, operation: &SyncOperation) -> Option<VersionRecord> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .find(|record| {
                record.version_hash == operation.version_hash && record.changes.contains(&operation.change)
            })
            .cloned()
    }

    /// Records appended after `version_hash`. An unknown or absent hash
    /// yields the whole history.
    pub fn changes_since(&self, version_hash: Option<&str>) -> Vec<VersionRecord> {
        let state = self.state.lock();
        let start = state.position_after(version_hash);
        state.history[start..].to_vec()
    }

    /// History index of the first record after `version_hash`, as used by
    /// [`changes_since`](Self::changes_since).
    pub fn position_after(&self, version_hash: Option<&str>) -> usize {
        self.state.lock().position_after(version_hash)
    }

    /// Records from history index `start` whose JSON fits in `max_bytes`,
    /// with the index to continue from when more follow.
    pub fn history_page(&self, start: usize, max_bytes: usize) -> (Vec<VersionRecord>, Option<usize>) {
        let state = self.state.lock();
        let tail = state.history.get(start..).unwrap_or_default();
        let taken = batch_len(tail, max_bytes);
        let next = start + taken;
        (tail[..taken].to_vec(), (next < state.history.len()).then_some(next))
    }

    /// Walks parent links from `version_hash` back to the root.
    pub fn chain(&self, version_hash: &str) -> Vec<VersionRecord> {
        let state = self.state.lock();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(version_hash.to_string());

        while let Some(hash) = cursor {
            if !seen.insert(hash.clone()) {
                break;
            }
            let Some(record) = state.history.iter().rev().find(|r| r.version_hash == hash) else {
                break;
            };
            cursor = record.parent_hash.clone();
            chain.push(record.clone());
        }
        chain
    }

    pub fn rows(&self, table: &str) -> Vec<(String, Row)> {
        self.state.lock().tables.scan(table)
    }

    pub fn get(&self, table: &str, record_id: &str) -> Option<Row> {
        self.state.lock().tables.get(table, record_id)
    }

    /// Runs `change` on a copy of the state, writes the copy to the snapshot
    /// and commits it. One writer at a time.
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _writer = self.writer.lock().await;
        let mut next = self.state.lock().clone();
        let output = change(&mut next)?;
        self.persist(&next).await?;
        *self.state.lock() = next;
        Ok(output)
    }

    fn replay_locked(&self, state: &mut StoreState, changes: &[ChangeRecord]) -> ReplayReport {
        let mut report = ReplayReport::default();
        for (index, change) in changes.iter().enumerate() {
            match self.apply_primitive(
                state,
                change.operation,
                &change.table,
                &change.record_id,
                change.data.clone(),
            ) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(
                        "Skipping {} {}/{} from {}: {}",
                        change.operation,
                        change.table,
                        change.record_id,
                        change.origin_peer.short(),
                        e
                    );
                    report.failed.push((index, e));
                }
            }
        }
        report
    }

    fn apply_primitive(
        &self,
        state: &mut StoreState,
        operation: Operation,
        table: &str,
        record_id: &str,
        data: Row,
    ) -> Result<(), StoreError> {
        if !self.versioned_tables.iter().any(|t| t == table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        match operation {
            Operation::Insert => state.tables.insert(table, record_id, data),
            Operation::Update => state.tables.update(table, record_id, data),
            Operation::Delete => state.tables.delete(table, record_id),
        }
    }

    /// SHA-256 over `table|id|row` lines, tables in configured order, rows
    /// id ascending, row JSON with sorted keys.
    fn compute_hash(&self, tables: &MemoryTables) -> String {
        let mut hasher = Sha256::new();
        for table in self.versioned_tables.iter() {
            for (id, row) in tables.scan(table) {
                let mut line = String::new();
                line.push_str(table);
                line.push('|');
                line.push_str(&id);
                line.push('|');
                write_canonical(&Value::Object(row), &mut line);
                line.push('\n');
                hasher.update(line.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let data = serde_json::to_vec(state)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

/// How many leading records fit in `max_bytes` once encoded as a JSON
/// array. A non-empty slice always yields at least one.
pub fn batch_len(records: &[VersionRecord], max_bytes: usize) -> usize {
    let mut used = 2usize;
    for (index, record) in records.iter().enumerate() {
        let size = serde_json::to_vec(record)
            .map(|bytes| bytes.len() + 1)
            .unwrap_or(usize::MAX);
        if index > 0 && used.saturating_add(size) > max_bytes {
            return index;
        }
        used = used.saturating_add(size);
    }
    records.len()
}

/// JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn tables() -> Vec<String> {
        DEFAULT_VERSIONED_TABLES.iter().map(|t| t.to_string()).collect()
    }

    fn store(peer: &str) -> VersionStore {
        VersionStore::in_memory(NodeId::from(peer), tables())
    }

    fn row(value: Value) -> Row {
        crate::protocol::object(value)
    }

    fn user(name: &str) -> Row {
        row(json!({ "username": name, "password_hash": "x" }))
    }

    #[tokio::test]
    async fn test_apply_change_links_to_previous_version() {
        let store = store("a");
        assert_eq!(store.current_version_hash(), None);

        let first = store
            .apply_change(Operation::Insert, "users", "u1", user("alice"))
            .await
            .unwrap();
        assert_eq!(first.parent_hash, None);
        assert_eq!(store.current_version_hash(), Some(first.version_hash.clone()));

        let before = store.current_version_hash();
        let second = store
            .apply_change(Operation::Update, "users", "u1", row(json!({ "username": "alicia" })))
            .await
            .unwrap();
        assert_eq!(second.parent_hash, before);
        assert_ne!(second.version_hash, first.version_hash);
        assert_eq!(store.history().len(), 2);
        assert_eq!(second.changes[0].origin_peer, NodeId::from("a"));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = store("a");
        store.apply_change(Operation::Insert, "users", "u1", user("alice")).await.unwrap();
        store
            .apply_change(Operation::Update, "users", "u1", row(json!({ "username": "alicia" })))
            .await
            .unwrap();
        let stored = store.get("users", "u1").unwrap();
        assert_eq!(stored["username"], "alicia");
        assert_eq!(stored["password_hash"], "x");
    }

    #[tokio::test]
    async fn test_failed_change_records_nothing() {
        let store = store("a");
        assert_matches!(
            store.apply_change(Operation::Insert, "secrets", "s1", Row::new()).await,
            Err(StoreError::UnknownTable(_))
        );
        assert_matches!(
            store.apply_change(Operation::Update, "users", "nobody", Row::new()).await,
            Err(StoreError::RecordNotFound { .. })
        );
        store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        assert_matches!(
            store.apply_change(Operation::Insert, "users", "u1", user("a")).await,
            Err(StoreError::DuplicateRecord { .. })
        );
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_records_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("store");
        let store = VersionStore::open(&dir, NodeId::from("a"), tables()).await.unwrap();
        let first = store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        assert_matches!(
            store.apply_change(Operation::Insert, "users", "u2", user("b")).await,
            Err(StoreError::Io(_))
        );
        assert_matches!(store.mark_applied(0).await, Err(StoreError::Io(_)));
        assert!(store.catch_up(&[], "elsewhere").await.is_err());

        assert_eq!(store.get("users", "u2"), None);
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.pending_changes().len(), 1);
        assert_eq!(store.current_version_hash(), Some(first.version_hash));

        // Once the directory is back the same change goes through.
        std::fs::create_dir_all(&dir).unwrap();
        store.apply_change(Operation::Insert, "users", "u2", user("b")).await.unwrap();
        assert_eq!(store.pending_changes().len(), 2);
    }

    #[tokio::test]
    async fn test_hash_is_deterministic_across_stores() {
        let a = store("a");
        let b = store("b");
        for s in [&a, &b] {
            s.apply_change(Operation::Insert, "users", "u2", user("bob")).await.unwrap();
            s.apply_change(Operation::Insert, "files", "f1", row(json!({ "filename": "a.txt", "file_size": 3 })))
                .await
                .unwrap();
            s.apply_change(Operation::Insert, "users", "u1", user("alice")).await.unwrap();
            s.apply_change(Operation::Delete, "users", "u2", Row::new()).await.unwrap();
        }
        assert_eq!(a.current_version_hash(), b.current_version_hash());
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[tokio::test]
    async fn test_hash_ignores_field_insertion_order() {
        let a = store("a");
        let b = store("b");
        let mut first = Row::new();
        first.insert("x".into(), json!(1));
        first.insert("y".into(), json!({ "b": 2, "a": 1 }));
        let mut second = Row::new();
        second.insert("y".into(), json!({ "a": 1, "b": 2 }));
        second.insert("x".into(), json!(1));

        a.apply_change(Operation::Insert, "files", "f", first).await.unwrap();
        b.apply_change(Operation::Insert, "files", "f", second).await.unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[tokio::test]
    async fn test_same_state_same_hash_regardless_of_history() {
        let a = store("a");
        let b = store("b");
        a.apply_change(Operation::Insert, "users", "u1", user("alice")).await.unwrap();
        b.apply_change(Operation::Insert, "users", "u9", user("temp")).await.unwrap();
        b.apply_change(Operation::Delete, "users", "u9", Row::new()).await.unwrap();
        b.apply_change(Operation::Insert, "users", "u1", user("alice")).await.unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[tokio::test]
    async fn test_pending_changes_and_mark_applied() {
        let store = store("a");
        store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        store.apply_change(Operation::Insert, "users", "u2", user("b")).await.unwrap();
        store.apply_change(Operation::Insert, "users", "u3", user("c")).await.unwrap();

        let pending = store.pending_changes();
        assert_eq!(pending.len(), 3);
        assert!(pending[0].change.timestamp <= pending[1].change.timestamp);
        assert_eq!(pending[0].change.record_id, "u1");

        assert!(store.mark_applied(pending[0].id).await.unwrap());
        assert!(!store.mark_applied(999).await.unwrap());
        assert_eq!(store.mark_all_applied(&[pending[2].id, 999]).await.unwrap(), 1);
        let pending = store.pending_changes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change.record_id, "u2");
    }

    #[tokio::test]
    async fn test_record_of_finds_the_right_link_for_a_repeated_hash() {
        let store = store("a");
        store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        store.apply_change(Operation::Delete, "users", "u1", Row::new()).await.unwrap();
        store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();

        let pending = store.pending_changes();
        let first = store.record_of(&pending[0]).unwrap();
        let last = store.record_of(&pending[2]).unwrap();
        assert_eq!(first.version_hash, last.version_hash);
        assert_eq!(first.parent_hash, None);
        assert_eq!(last.parent_hash, Some(pending[1].version_hash.clone()));
        assert!(!first.same_record(&last));
    }

    #[tokio::test]
    async fn test_replay_skips_failures_and_continues() {
        let origin = store("origin");
        origin.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        origin.apply_change(Operation::Insert, "users", "u2", user("b")).await.unwrap();
        let mut changes: Vec<ChangeRecord> = origin
            .history()
            .into_iter()
            .flat_map(|record| record.changes)
            .collect();
        changes.insert(
            1,
            ChangeRecord {
                operation: Operation::Update,
                table: "users".into(),
                record_id: "ghost".into(),
                data: Row::new(),
                timestamp: Utc::now(),
                origin_peer: NodeId::from("origin"),
            },
        );

        let replica = store("replica");
        let report = replica.replay(&changes).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 1);
        assert_eq!(replica.rows("users").len(), 2);
        assert_eq!(replica.state_hash(), origin.state_hash());
        assert!(replica.pending_changes().is_empty());
        assert_eq!(replica.current_version_hash(), None);
    }

    #[tokio::test]
    async fn test_catch_up_adopts_reported_version() {
        let origin = store("origin");
        origin.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        origin
            .apply_change(Operation::Insert, "files", "f1", row(json!({ "filename": "x" })))
            .await
            .unwrap();
        let latest = origin.current_version_hash().unwrap();

        let replica = store("replica");
        let report = replica.catch_up(&origin.history(), &latest).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(replica.current_version_hash(), Some(latest.clone()));
        assert_eq!(replica.state_hash(), origin.state_hash());
        assert_eq!(replica.chain(&latest).len(), 2);

        // Already known records are not replayed twice.
        let report = replica.catch_up(&origin.history(), &latest).await.unwrap();
        assert_eq!(report.applied, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_catch_up_replays_return_to_earlier_state() {
        let origin = store("origin");
        let replica = store("replica");

        let inserted = origin.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        replica
            .catch_up(&origin.changes_since(None), &inserted.version_hash)
            .await
            .unwrap();

        let deleted = origin.apply_change(Operation::Delete, "users", "u1", Row::new()).await.unwrap();
        replica
            .catch_up(&origin.changes_since(Some(&inserted.version_hash)), &deleted.version_hash)
            .await
            .unwrap();
        assert_eq!(replica.get("users", "u1"), None);

        // Re-inserting reproduces the first hash, but it is a new link.
        let reinserted = origin.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        assert_eq!(reinserted.version_hash, inserted.version_hash);
        let batch = origin.changes_since(Some(&deleted.version_hash));
        assert_eq!(batch.len(), 1);

        let report = replica.catch_up(&batch, &reinserted.version_hash).await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(replica.get("users", "u1").is_some());
        assert_eq!(replica.state_hash(), origin.state_hash());
        assert_eq!(replica.current_version_hash(), origin.current_version_hash());
        assert_eq!(replica.history_len(), 3);
    }

    #[tokio::test]
    async fn test_changes_since_and_chain() {
        let store = store("a");
        let v1 = store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        let v2 = store.apply_change(Operation::Insert, "users", "u2", user("b")).await.unwrap();
        let v3 = store.apply_change(Operation::Insert, "users", "u3", user("c")).await.unwrap();

        let since = store.changes_since(Some(&v1.version_hash));
        assert_eq!(since, vec![v2.clone(), v3.clone()]);
        assert_eq!(store.changes_since(None).len(), 3);
        assert_eq!(store.changes_since(Some("0")).len(), 3);
        assert!(store.changes_since(Some(&v3.version_hash)).is_empty());
        assert_eq!(store.position_after(Some(&v1.version_hash)), 1);

        let chain: Vec<String> = store
            .chain(&v3.version_hash)
            .into_iter()
            .map(|record| record.version_hash)
            .collect();
        assert_eq!(chain, vec![v3.version_hash, v2.version_hash, v1.version_hash]);
        assert!(store.chain("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_history_page_respects_byte_budget() {
        let store = store("a");
        let blob = "x".repeat(2_000);
        for i in 0..20 {
            store
                .apply_change(Operation::Insert, "files", &format!("f{}", i), row(json!({ "blob": blob })))
                .await
                .unwrap();
        }

        let budget = 10_000;
        let mut start = 0;
        let mut collected = Vec::new();
        loop {
            let (page, next) = store.history_page(start, budget);
            assert!(!page.is_empty());
            assert!(serde_json::to_vec(&page).unwrap().len() <= budget);
            collected.extend(page);
            match next {
                Some(next) => start = next,
                None => break,
            }
        }
        assert_eq!(collected, store.history());

        // A record larger than the budget still goes out on its own.
        let (page, next) = store.history_page(0, 10);
        assert_eq!(page.len(), 1);
        assert_eq!(next, Some(1));
        assert_eq!(store.history_page(20, budget), (Vec::new(), None));
        assert_eq!(store.history_page(99, budget), (Vec::new(), None));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let hash = {
            let store = VersionStore::open(temp_dir.path(), NodeId::from("a"), tables()).await.unwrap();
            store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
            let pending = store.pending_changes();
            store.mark_applied(pending[0].id).await.unwrap();
            store.apply_change(Operation::Insert, "users", "u2", user("b")).await.unwrap();
            store.current_version_hash().unwrap()
        };

        let reopened = VersionStore::open(temp_dir.path(), NodeId::from("a"), tables()).await.unwrap();
        assert_eq!(reopened.current_version_hash(), Some(hash));
        assert_eq!(reopened.history().len(), 2);
        assert_eq!(reopened.pending_changes().len(), 1);
        assert_eq!(reopened.get("users", "u2").unwrap()["username"], "b");

        let next = reopened.apply_change(Operation::Insert, "users", "u3", user("c")).await.unwrap();
        let ids: HashSet<u64> = reopened.pending_changes().iter().map(|op| op.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(next.changes.len(), 1);
    }

    #[tokio::test]
    async fn test_change_record_wire_names() {
        let store = store("a");
        let record = store.apply_change(Operation::Insert, "users", "u1", user("a")).await.unwrap();
        let value = serde_json::to_value(&record).unwrap();
        let change = &value["changes"][0];
        assert_eq!(change["operation_type"], "INSERT");
        assert_eq!(change["table_name"], "users");
        assert_eq!(change["record_id"], "u1");
        assert_eq!(change["peer_id"], "a");
        assert_eq!(value["is_snapshot"], false);
        assert!(value["parent_hash"].is_null());

        let decoded: VersionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_records_accept_offset_less_timestamps() {
        let raw = r#"{
            "version_hash": "h2",
            "parent_hash": "h1",
            "peer_id": "p",
            "changes": [{
                "operation_type": "INSERT",
                "table_name": "users",
                "record_id": "u1",
                "data": {"username": "a"},
                "timestamp": "2024-05-01T12:30:45.123456",
                "peer_id": "p"
            }],
            "timestamp": "2024-05-01T12:30:45"
        }"#;
        let record: VersionRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(
            crate::protocol::format_timestamp(&record.changes[0].timestamp),
            "2024-05-01T12:30:45.123456Z"
        );
        assert_eq!(crate::protocol::format_timestamp(&record.timestamp), "2024-05-01T12:30:45Z");
        assert!(!record.is_snapshot);

        let bad = raw.replace("2024-05-01T12:30:45\"", "yesterday\"");
        assert!(serde_json::from_str::<VersionRecord>(&bad).is_err());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(&json!({ "b": [ { "z": 1, "a": null } ], "a": "s" }), &mut out);
        assert_eq!(out, r#"{"a":"s","b":[{"a":null,"z":1}]}"#);
    }
}
