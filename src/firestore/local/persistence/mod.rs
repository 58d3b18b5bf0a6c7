//! Durable storage for the local store.
//!
//! All state lives in a [`TableSet`] held in memory. Transactions read the
//! tables through a [`PersistenceTransaction`], which records writes into a
//! [`TableDelta`]. When the closure succeeds the delta is committed to the
//! [`Persistence`] backend and only then folded into memory, so a failed
//! transaction leaves no trace in either place.

mod file;
mod memory;

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::core::TargetData;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, ListenSequenceNumber, MutableDocument, MutationBatch,
    Overlay, SnapshotVersion, TargetId,
};

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Storage backend for the local store.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Acquires ownership of the storage and loads everything persisted so far.
    async fn start(&self) -> FirestoreResult<TableSet>;

    /// Durably records one committed transaction.
    async fn commit(&self, delta: &TableDelta) -> FirestoreResult<()>;

    /// Whether the backend would like a full snapshot of the tables.
    fn wants_checkpoint(&self) -> bool {
        false
    }

    async fn checkpoint(&self, _tables: &TableSet) -> FirestoreResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()>;

    /// Whether unreferenced documents are dropped as soon as the last
    /// reference to them disappears.
    fn uses_eager_gc(&self) -> bool;
}

/// Singleton metadata stored next to the target table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Globals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub last_batch_id: BatchId,
}

/// Per-user mutation queue metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueMetadata {
    pub last_stream_token: Vec<u8>,
}

/// Every logical table of the local store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableSet {
    #[serde(with = "pairs", default)]
    pub remote_documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Keyed by `(uid, batch_id)`.
    #[serde(with = "pairs", default)]
    pub mutation_batches: BTreeMap<(String, BatchId), MutationBatch>,
    /// Keyed by `(uid, document, batch_id)`.
    #[serde(with = "pairs", default)]
    pub document_mutations: BTreeMap<(String, DocumentKey, BatchId), ()>,
    #[serde(with = "pairs", default)]
    pub mutation_queues: BTreeMap<String, MutationQueueMetadata>,
    /// Keyed by `(uid, document)`.
    #[serde(with = "pairs", default)]
    pub document_overlays: BTreeMap<(String, DocumentKey), Overlay>,
    #[serde(with = "pairs", default)]
    pub targets: BTreeMap<TargetId, TargetData>,
    #[serde(with = "pairs", default)]
    pub target_documents: BTreeMap<(TargetId, DocumentKey), ()>,
    #[serde(with = "pairs", default)]
    pub document_targets: BTreeMap<(DocumentKey, TargetId), ()>,
    #[serde(with = "pairs", default)]
    pub field_indexes: BTreeMap<i32, FieldIndex>,
    /// Keyed by `(index_id, encoded values, document)`.
    #[serde(with = "pairs", default)]
    pub index_entries: BTreeMap<(i32, Vec<u8>, DocumentKey), ()>,
    #[serde(default)]
    pub globals: Globals,
}

/// A pending write to one row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Change<V> {
    Put(V),
    Delete,
}

/// Writes recorded by one transaction, keyed like [`TableSet`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableDelta {
    #[serde(with = "pairs", default)]
    pub remote_documents: BTreeMap<DocumentKey, Change<MutableDocument>>,
    #[serde(with = "pairs", default)]
    pub mutation_batches: BTreeMap<(String, BatchId), Change<MutationBatch>>,
    #[serde(with = "pairs", default)]
    pub document_mutations: BTreeMap<(String, DocumentKey, BatchId), Change<()>>,
    #[serde(with = "pairs", default)]
    pub mutation_queues: BTreeMap<String, Change<MutationQueueMetadata>>,
    #[serde(with = "pairs", default)]
    pub document_overlays: BTreeMap<(String, DocumentKey), Change<Overlay>>,
    #[serde(with = "pairs", default)]
    pub targets: BTreeMap<TargetId, Change<TargetData>>,
    #[serde(with = "pairs", default)]
    pub target_documents: BTreeMap<(TargetId, DocumentKey), Change<()>>,
    #[serde(with = "pairs", default)]
    pub document_targets: BTreeMap<(DocumentKey, TargetId), Change<()>>,
    #[serde(with = "pairs", default)]
    pub field_indexes: BTreeMap<i32, Change<FieldIndex>>,
    #[serde(with = "pairs", default)]
    pub index_entries: BTreeMap<(i32, Vec<u8>, DocumentKey), Change<()>>,
    #[serde(default)]
    pub globals: Option<Globals>,
}

impl TableDelta {
    pub fn is_empty(&self) -> bool {
        self.remote_documents.is_empty()
            && self.mutation_batches.is_empty()
            && self.document_mutations.is_empty()
            && self.mutation_queues.is_empty()
            && self.document_overlays.is_empty()
            && self.targets.is_empty()
            && self.target_documents.is_empty()
            && self.document_targets.is_empty()
            && self.field_indexes.is_empty()
            && self.index_entries.is_empty()
            && self.globals.is_none()
    }
}

impl TableSet {
    pub fn apply(&mut self, delta: TableDelta) {
        apply_changes(&mut self.remote_documents, delta.remote_documents);
        apply_changes(&mut self.mutation_batches, delta.mutation_batches);
        apply_changes(&mut self.document_mutations, delta.document_mutations);
        apply_changes(&mut self.mutation_queues, delta.mutation_queues);
        apply_changes(&mut self.document_overlays, delta.document_overlays);
        apply_changes(&mut self.targets, delta.targets);
        apply_changes(&mut self.target_documents, delta.target_documents);
        apply_changes(&mut self.document_targets, delta.document_targets);
        apply_changes(&mut self.field_indexes, delta.field_indexes);
        apply_changes(&mut self.index_entries, delta.index_entries);
        if let Some(globals) = delta.globals {
            self.globals = globals;
        }
    }
}

fn apply_changes<K: Ord, V>(table: &mut BTreeMap<K, V>, changes: BTreeMap<K, Change<V>>) {
    for (key, change) in changes {
        match change {
            Change::Put(value) => {
                table.insert(key, value);
            }
            Change::Delete => {
                table.remove(&key);
            }
        }
    }
}

/// Read-through, write-back view of one table inside a transaction.
pub struct TableRef<'t, K, V> {
    base: &'t BTreeMap<K, V>,
    changes: &'t mut BTreeMap<K, Change<V>>,
}

impl<K: Ord + Clone, V: Clone> TableRef<'_, K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        match self.changes.get(key) {
            Some(Change::Put(value)) => Some(value.clone()),
            Some(Change::Delete) => None,
            None => self.base.get(key).cloned(),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        match self.changes.get(key) {
            Some(Change::Put(_)) => true,
            Some(Change::Delete) => false,
            None => self.base.contains_key(key),
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.changes.insert(key, Change::Put(value));
    }

    pub fn delete(&mut self, key: K) {
        self.changes.insert(key, Change::Delete);
    }

    /// All live rows in `range`, in key order.
    pub fn scan<R>(&self, range: R) -> Vec<(K, V)>
    where
        R: RangeBounds<K> + Clone,
    {
        let mut rows: BTreeMap<K, V> = self
            .base
            .range(range.clone())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, change) in self.changes.range(range) {
            match change {
                Change::Put(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                Change::Delete => {
                    rows.remove(key);
                }
            }
        }
        rows.into_iter().collect()
    }

    pub fn scan_all(&self) -> Vec<(K, V)> {
        self.scan::<std::ops::RangeFull>(..)
    }
}

/// A transaction over the local tables.
pub struct PersistenceTransaction<'a> {
    base: &'a TableSet,
    delta: TableDelta,
    sequence_number: ListenSequenceNumber,
}

impl<'a> PersistenceTransaction<'a> {
    fn new(base: &'a TableSet) -> Self {
        Self {
            base,
            delta: TableDelta::default(),
            sequence_number: base.globals.highest_listen_sequence_number + 1,
        }
    }

    /// Sequence number stamped on targets touched by this transaction.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn remote_documents(&mut self) -> TableRef<'_, DocumentKey, MutableDocument> {
        TableRef {
            base: &self.base.remote_documents,
            changes: &mut self.delta.remote_documents,
        }
    }

    pub fn mutation_batches(&mut self) -> TableRef<'_, (String, BatchId), MutationBatch> {
        TableRef {
            base: &self.base.mutation_batches,
            changes: &mut self.delta.mutation_batches,
        }
    }

    pub fn document_mutations(&mut self) -> TableRef<'_, (String, DocumentKey, BatchId), ()> {
        TableRef {
            base: &self.base.document_mutations,
            changes: &mut self.delta.document_mutations,
        }
    }

    pub fn mutation_queues(&mut self) -> TableRef<'_, String, MutationQueueMetadata> {
        TableRef {
            base: &self.base.mutation_queues,
            changes: &mut self.delta.mutation_queues,
        }
    }

    pub fn document_overlays(&mut self) -> TableRef<'_, (String, DocumentKey), Overlay> {
        TableRef {
            base: &self.base.document_overlays,
            changes: &mut self.delta.document_overlays,
        }
    }

    pub fn targets(&mut self) -> TableRef<'_, TargetId, TargetData> {
        TableRef {
            base: &self.base.targets,
            changes: &mut self.delta.targets,
        }
    }

    pub fn target_documents(&mut self) -> TableRef<'_, (TargetId, DocumentKey), ()> {
        TableRef {
            base: &self.base.target_documents,
            changes: &mut self.delta.target_documents,
        }
    }

    pub fn document_targets(&mut self) -> TableRef<'_, (DocumentKey, TargetId), ()> {
        TableRef {
            base: &self.base.document_targets,
            changes: &mut self.delta.document_targets,
        }
    }

    pub fn field_indexes(&mut self) -> TableRef<'_, i32, FieldIndex> {
        TableRef {
            base: &self.base.field_indexes,
            changes: &mut self.delta.field_indexes,
        }
    }

    pub fn index_entries(&mut self) -> TableRef<'_, (i32, Vec<u8>, DocumentKey), ()> {
        TableRef {
            base: &self.base.index_entries,
            changes: &mut self.delta.index_entries,
        }
    }

    pub fn globals(&self) -> Globals {
        self.delta
            .globals
            .clone()
            .unwrap_or_else(|| self.base.globals.clone())
    }

    pub fn set_globals(&mut self, globals: Globals) {
        self.delta.globals = Some(globals);
    }

    fn into_delta(self) -> TableDelta {
        self.delta
    }
}

/// Owns the in-memory tables and runs transactions against a backend.
pub struct TransactionRunner {
    backend: Arc<dyn Persistence>,
    tables: TableSet,
}

impl TransactionRunner {
    pub async fn start(backend: Arc<dyn Persistence>) -> FirestoreResult<Self> {
        let tables = backend.start().await?;
        Ok(Self { backend, tables })
    }

    /// Runs `action` and commits its writes atomically. Nothing is written
    /// when `action` or the commit fails.
    pub async fn run_transaction<T, F>(&mut self, label: &str, action: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let (result, delta) = {
            let mut txn = PersistenceTransaction::new(&self.tables);
            let result = action(&mut txn)?;
            (result, txn.into_delta())
        };
        if delta.is_empty() {
            return Ok(result);
        }
        if let Err(err) = self.backend.commit(&delta).await {
            log::debug!("transaction '{label}' failed to commit: {err}");
            return Err(err);
        }
        self.tables.apply(delta);
        if self.backend.wants_checkpoint() {
            if let Err(err) = self.backend.checkpoint(&self.tables).await {
                log::warn!("checkpoint after '{label}' failed: {err}");
            }
        }
        Ok(result)
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn uses_eager_gc(&self) -> bool {
        self.backend.uses_eager_gc()
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.backend.shutdown().await
    }
}

/// Serializes maps with structured keys as a sequence of pairs.
mod pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_no_document(
            key(path),
            SnapshotVersion::new(crate::firestore::model::Timestamp::new(version, 0)),
        )
    }

    #[tokio::test]
    async fn reads_see_uncommitted_writes() {
        let backend = Arc::new(MemoryPersistence::new());
        let mut runner = TransactionRunner::start(backend).await.unwrap();
        runner
            .run_transaction("seed", |txn| {
                txn.remote_documents().put(key("c/a"), doc("c/a", 1));
                txn.remote_documents().put(key("c/b"), doc("c/b", 1));
                Ok(())
            })
            .await
            .unwrap();

        let rows = runner
            .run_transaction("read", |txn| {
                txn.remote_documents().delete(key("c/a"));
                txn.remote_documents().put(key("c/c"), doc("c/c", 2));
                Ok(txn.remote_documents().scan_all())
            })
            .await
            .unwrap();
        let keys: Vec<_> = rows.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key("c/b"), key("c/c")]);
    }

    #[tokio::test]
    async fn failed_action_discards_writes() {
        let backend = Arc::new(MemoryPersistence::new());
        let mut runner = TransactionRunner::start(backend).await.unwrap();
        let result: FirestoreResult<()> = runner
            .run_transaction("fail", |txn| {
                txn.remote_documents().put(key("c/a"), doc("c/a", 1));
                Err(unavailable("boom"))
            })
            .await;
        assert!(result.is_err());
        assert!(runner.tables().remote_documents.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_discards_writes() {
        let backend = Arc::new(MemoryPersistence::new());
        let mut runner = TransactionRunner::start(backend.clone()).await.unwrap();
        backend.fail_next_commits(1);
        let result = runner
            .run_transaction("write", |txn| {
                txn.remote_documents().put(key("c/a"), doc("c/a", 1));
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_transient_storage());
        assert!(runner.tables().remote_documents.is_empty());
    }

    #[test]
    fn delta_round_trips_through_json() {
        let mut delta = TableDelta::default();
        delta
            .target_documents
            .insert((2, key("c/a")), Change::Put(()));
        delta.target_documents.insert((2, key("c/b")), Change::Delete);
        let json = serde_json::to_string(&delta).unwrap();
        let decoded: TableDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.target_documents, delta.target_documents);
    }
}
