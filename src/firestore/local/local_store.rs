//! The local store: the single owner of cached documents, pending writes
//! and target metadata.
//!
//! Every public operation runs as one atomic transaction against the
//! configured [`Persistence`] backend. In-memory bookkeeping (active
//! targets, local view references) is only updated after the transaction
//! committed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_lock::Mutex;

use crate::firestore::core::{Query, Target, TargetData, TargetPurpose, User};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents::LocalDocumentsView;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{
    Persistence, PersistenceTransaction, TransactionRunner,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::RemoteEvent;
use crate::firestore::settings::SyncSettings;
use crate::util::hard_assert;

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Outcome of [`LocalStore::write_locally`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local views of every written document.
    pub changes: DocumentMap,
}

/// Outcome of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Outcome of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Documents that entered or left a view since its last snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

pub struct LocalStore {
    state: Mutex<LocalStoreState>,
}

struct LocalStoreState {
    runner: TransactionRunner,
    user: User,
    mutation_queue: MutationQueue,
    overlay_cache: DocumentOverlayCache,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
    local_view_references: ReferenceSet,
    /// Documents that lost a reference and may be collectable.
    orphaned_documents: BTreeSet<DocumentKey>,
}

/// Removes cached documents nothing refers to anymore. Only active when the
/// backend asks for eager collection.
struct EagerCollector<'a> {
    enabled: bool,
    local_view_references: &'a ReferenceSet,
    pending: &'a BTreeSet<DocumentKey>,
}

impl EagerCollector<'_> {
    fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mutation_queue: &MutationQueue,
        mut candidates: BTreeSet<DocumentKey>,
    ) -> BTreeSet<DocumentKey> {
        let mut removed = BTreeSet::new();
        if !self.enabled {
            return removed;
        }
        candidates.extend(self.pending.iter().cloned());
        for key in candidates {
            let referenced = self.local_view_references.contains_key(&key)
                || TargetCache::contains_key(txn, &key)
                || mutation_queue.contains_key(txn, &key);
            if !referenced {
                RemoteDocumentCache::remove_entry(txn, &key);
                removed.insert(key);
            }
        }
        if !removed.is_empty() {
            log::debug!("collected {} unreferenced documents", removed.len());
        }
        removed
    }
}

/// Builds the collector from disjoint fields so the transaction runner can
/// still be borrowed mutably.
macro_rules! collector {
    ($state:expr) => {
        EagerCollector {
            enabled: $state.runner.uses_eager_gc(),
            local_view_references: &$state.local_view_references,
            pending: &$state.orphaned_documents,
        }
    };
}

impl LocalStore {
    /// Opens the backend and loads persisted state for `user`.
    pub async fn start(
        persistence: Arc<dyn Persistence>,
        user: User,
        settings: &SyncSettings,
    ) -> FirestoreResult<Self> {
        let runner = TransactionRunner::start(persistence).await?;
        let state = LocalStoreState {
            runner,
            mutation_queue: MutationQueue::new(&user),
            overlay_cache: DocumentOverlayCache::new(&user),
            user,
            query_engine: QueryEngine::new(settings),
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: HashMap::new(),
            local_view_references: ReferenceSet::new(),
            orphaned_documents: BTreeSet::new(),
        };
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        let state = self.state.lock().await;
        state.runner.shutdown().await
    }

    pub async fn current_user(&self) -> User {
        self.state.lock().await.user.clone()
    }

    /// Switches the mutation queue and overlays to `user` and reports the
    /// documents whose local view may have changed.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let old_queue = &state.mutation_queue;
        let new_queue = MutationQueue::new(&user);
        let new_overlays = DocumentOverlayCache::new(&user);

        let result = state
            .runner
            .run_transaction("handle_user_change", |txn| {
                let old_batches = old_queue.all_mutation_batches(txn);
                let new_batches = new_queue.all_mutation_batches(txn);
                let mut changed_keys = BTreeSet::new();
                for batch in old_batches.iter().chain(&new_batches) {
                    changed_keys.extend(batch.keys());
                }
                let view = LocalDocumentsView::new(&new_queue, &new_overlays);
                Ok(UserChangeResult {
                    affected_documents: view.get_documents(txn, &changed_keys)?,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;

        log::debug!("switched local store from user {} to {user}", state.user);
        state.mutation_queue = new_queue;
        state.overlay_cache = new_overlays;
        state.user = user;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local views.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = &state.mutation_queue;
        let overlays = &state.overlay_cache;

        state
            .runner
            .run_transaction("write_locally", |txn| {
                let remote_documents = RemoteDocumentCache::get_entries(txn, &keys);
                let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let view = LocalDocumentsView::new(queue, overlays);
                let mut overlayed = view.get_overlayed_documents(txn, remote_documents)?;

                // Non-idempotent transforms need the value they started from,
                // so later remote changes do not alter what the user saw.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(current) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) =
                        mutation.extract_transform_base_value(&current.document)
                    {
                        let mask = base_value.field_mask();
                        base_mutations.push(Mutation::patch(
                            mutation.key().clone(),
                            base_value,
                            mask,
                        ));
                    }
                }

                let batch =
                    queue.add_mutation_batch(txn, local_write_time, base_mutations, mutations)?;
                let overlay_mutations = batch
                    .apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                overlays.save_overlays(txn, batch.batch_id, &overlay_mutations);
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies the backend's acknowledgment of the oldest pending batch.
    pub async fn acknowledge_batch(&self, result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let overlays = &state.overlay_cache;

        let documents = state
            .runner
            .run_transaction("acknowledge_batch", |txn| {
                let batch = &result.batch;
                let affected = batch.keys();
                for key in &affected {
                    let mut document = RemoteDocumentCache::get_entry(txn, key);
                    let ack_version = result.doc_versions.get(key).copied();
                    hard_assert(ack_version.is_some(), "acknowledgment missing a document version")?;
                    if ack_version.is_some_and(|version| document.version() < version) {
                        batch.apply_to_remote_document(&mut document, &result)?;
                        if document.is_valid_document() {
                            RemoteDocumentCache::add_entry(txn, document, result.commit_version);
                        }
                    }
                }
                queue.remove_mutation_batch(txn, batch)?;
                queue.set_last_stream_token(txn, result.stream_token.clone());
                queue.perform_consistency_check(txn)?;
                overlays.remove_overlays_for_batch_id(txn, &affected, batch.batch_id);

                let keys_with_transform_results: BTreeSet<DocumentKey> = batch
                    .mutations
                    .iter()
                    .zip(&result.mutation_results)
                    .filter(|(_, mutation_result)| !mutation_result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key().clone())
                    .collect();
                let view = LocalDocumentsView::new(queue, overlays);
                view.recalculate_and_save_overlays_for_document_keys(
                    txn,
                    &keys_with_transform_results,
                )?;
                let documents = view.get_documents(txn, &affected)?;
                collector.collect(txn, queue, affected);
                Ok(documents)
            })
            .await?;
        state.orphaned_documents.clear();
        Ok(documents)
    }

    /// Drops a batch the backend refused and returns the restored views.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let overlays = &state.overlay_cache;

        let documents = state
            .runner
            .run_transaction("reject_batch", |txn| {
                let batch = queue.lookup_mutation_batch(txn, batch_id);
                hard_assert(batch.is_some(), format!("unknown batch {batch_id} rejected"))?;
                let Some(batch) = batch else {
                    return Ok(DocumentMap::new());
                };
                let affected = batch.keys();
                queue.remove_mutation_batch(txn, &batch)?;
                queue.perform_consistency_check(txn)?;
                overlays.remove_overlays_for_batch_id(txn, &affected, batch.batch_id);
                let view = LocalDocumentsView::new(queue, overlays);
                view.recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                let documents = view.get_documents(txn, &affected)?;
                collector.collect(txn, queue, affected);
                Ok(documents)
            })
            .await?;
        state.orphaned_documents.clear();
        Ok(documents)
    }

    pub async fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = &state.mutation_queue;
        state
            .runner
            .run_transaction("highest_unacknowledged_batch_id", |txn| {
                Ok(queue.highest_unacknowledged_batch_id(txn))
            })
            .await
    }

    /// The oldest pending batch with an id greater than `after_batch_id`.
    pub async fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = &state.mutation_queue;
        state
            .runner
            .run_transaction("next_mutation_batch", |txn| {
                Ok(queue.next_mutation_batch_after_batch_id(txn, after_batch_id))
            })
            .await
    }

    pub async fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = &state.mutation_queue;
        state
            .runner
            .run_transaction("last_stream_token", |txn| Ok(queue.last_stream_token(txn)))
            .await
    }

    pub async fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = &state.mutation_queue;
        state
            .runner
            .run_transaction("set_last_stream_token", |txn| {
                queue.set_last_stream_token(txn, token);
                Ok(())
            })
            .await
    }

    pub async fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let guard = self.state.lock().await;
        Ok(guard.runner.tables().globals.last_remote_snapshot_version)
    }

    /// Folds a watch snapshot into the cache and returns the local views of
    /// the documents it changed.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let overlays = &state.overlay_cache;
        let active_targets = &state.target_data_by_target;

        let (documents, updated_targets) = state
            .runner
            .run_transaction("apply_remote_event", |txn| {
                let remote_version = event.snapshot_version;
                let mut candidates = BTreeSet::new();
                let mut updated_targets = BTreeMap::new();

                for (target_id, change) in &event.target_changes {
                    // Limbo resolutions and released targets are not tracked here.
                    let Some(old) = active_targets.get(target_id) else {
                        continue;
                    };
                    TargetCache::remove_matching_keys(txn, &change.removed_documents, *target_id);
                    candidates.extend(change.removed_documents.iter().cloned());
                    TargetCache::add_matching_keys(txn, &change.added_documents, *target_id);

                    let mut updated = old
                        .clone()
                        .with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    TargetCache::update_target_data(txn, updated.clone());
                    updated_targets.insert(*target_id, updated);
                }

                candidates.extend(
                    event
                        .resolved_limbo_documents
                        .iter()
                        .filter(|key| event.document_updates.contains_key(*key))
                        .cloned(),
                );

                let existing = RemoteDocumentCache::get_entries(txn, event.document_updates.keys());
                let mut changed = DocumentMap::new();
                let mut existence_changed = BTreeSet::new();
                for (key, document) in &event.document_updates {
                    let Some(cached) = existing.get(key) else {
                        continue;
                    };
                    if document.is_found_document() != cached.is_found_document() {
                        existence_changed.insert(key.clone());
                    }
                    // Deletions at the min version are synthesized when access
                    // to a limbo document was lost; they must never add entries.
                    if document.is_no_document() && document.version().is_min() {
                        RemoteDocumentCache::remove_entry(txn, key);
                        changed.insert(key.clone(), document.clone());
                    } else if !cached.is_valid_document()
                        || document.version() > cached.version()
                        || (document.version() == cached.version() && cached.has_pending_writes())
                    {
                        RemoteDocumentCache::add_entry(txn, document.clone(), remote_version);
                        changed.insert(key.clone(), document.clone());
                    } else {
                        log::debug!(
                            "ignoring outdated watch update for {key}: cached {}, watch {}",
                            cached.version(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last = TargetCache::last_remote_snapshot_version(txn);
                    hard_assert(
                        remote_version >= last,
                        format!("watch stream reverted to {remote_version} from {last}"),
                    )?;
                    let sequence_number = txn.current_sequence_number();
                    TargetCache::set_targets_metadata(txn, sequence_number, remote_version);
                }

                let view = LocalDocumentsView::new(queue, overlays);
                let documents = view.get_local_view_of_documents(txn, changed, &existence_changed)?;
                collector.collect(txn, queue, candidates);
                Ok((documents, updated_targets))
            })
            .await?;

        state.target_data_by_target.extend(updated_targets);
        state.orphaned_documents.clear();
        Ok(documents)
    }

    /// Records which documents each view now shows. Views that are in sync
    /// with the backend also advance their last limbo-free snapshot.
    pub async fn notify_local_view_changes(&self, changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut released = BTreeSet::new();
        for change in &changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            released.extend(change.removed_keys.iter().cloned());
        }

        let mut limbo_free = Vec::new();
        for change in changes.iter().filter(|change| !change.from_cache) {
            if let Some(data) = state.target_data_by_target.get(&change.target_id) {
                if data.last_limbo_free_snapshot_version != data.snapshot_version {
                    let version = data.snapshot_version;
                    limbo_free.push(data.clone().with_last_limbo_free_snapshot_version(version));
                }
            }
        }

        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let persisted = state
            .runner
            .run_transaction("notify_local_view_changes", |txn| {
                for data in &limbo_free {
                    TargetCache::update_target_data(txn, data.clone());
                }
                collector.collect(txn, queue, released.clone());
                Ok(())
            })
            .await;
        match persisted {
            Ok(()) => state.orphaned_documents.clear(),
            Err(err) if err.is_transient_storage() => {
                log::debug!("failed to persist local view changes: {err}");
                // Collected by the next transaction that runs the collector.
                if state.runner.uses_eager_gc() {
                    state.orphaned_documents.extend(released);
                }
            }
            Err(err) => return Err(err),
        }
        for data in limbo_free {
            state.target_data_by_target.insert(data.target_id, data);
        }
        Ok(())
    }

    /// Assigns a target id to `target`, reusing the persisted one when the
    /// target was seen before.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(data) = state
            .target_id_by_canonical_id
            .get(target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
        {
            return Ok(data.clone());
        }

        let data = state
            .runner
            .run_transaction("allocate_target", |txn| {
                if let Some(cached) = TargetCache::get_target_data(txn, &target) {
                    return Ok(cached);
                }
                let target_id = TargetCache::allocate_target_id(txn);
                let data = TargetData::new(
                    target,
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                TargetCache::add_target_data(txn, data.clone());
                Ok(data)
            })
            .await?;

        let newer = state
            .target_data_by_target
            .get(&data.target_id)
            .map_or(true, |existing| data.snapshot_version > existing.snapshot_version);
        if newer {
            state
                .target_id_by_canonical_id
                .insert(data.target.canonical_id().to_string(), data.target_id);
            state.target_data_by_target.insert(data.target_id, data.clone());
        }
        Ok(data)
    }

    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(data) = state
            .target_id_by_canonical_id
            .get(target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
        {
            return Ok(Some(data.clone()));
        }
        state
            .runner
            .run_transaction("get_target_data", |txn| {
                Ok(TargetCache::get_target_data(txn, target))
            })
            .await
    }

    /// Stops tracking an active target. With eager collection the target
    /// and its matches are deleted unless `keep_persisted_target_data`;
    /// otherwise it stays cached so a later listen can resume it.
    pub async fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(data) = state.target_data_by_target.get(&target_id).cloned() else {
            log::debug!("release of inactive target {target_id} ignored");
            return Ok(());
        };

        let orphaned = state.local_view_references.remove_references_for_id(target_id);
        let eager = state.runner.uses_eager_gc();
        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let result = state
            .runner
            .run_transaction("release_target", |txn| {
                if keep_persisted_target_data {
                    return Ok(());
                }
                if eager {
                    let mut released = TargetCache::remove_target_data(txn, target_id);
                    released.extend(orphaned.iter().cloned());
                    collector.collect(txn, queue, released);
                } else {
                    let sequence_number = txn.current_sequence_number();
                    TargetCache::update_target_data(
                        txn,
                        data.clone().with_sequence_number(sequence_number),
                    );
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => state.orphaned_documents.clear(),
            Err(err) if err.is_transient_storage() => {
                log::debug!("failed to update target {target_id} on release: {err}");
                if eager {
                    state.orphaned_documents.extend(orphaned);
                }
            }
            Err(err) => {
                state.local_view_references.add_references(&orphaned, target_id);
                return Err(err);
            }
        }

        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local view. With `use_previous_results` the
    /// target's last synced result set seeds the answer.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let target = query.to_target();
        let active = state
            .target_id_by_canonical_id
            .get(target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .cloned();
        let queue = &state.mutation_queue;
        let overlays = &state.overlay_cache;
        let engine = &state.query_engine;

        state
            .runner
            .run_transaction("execute_query", |txn| {
                let target_data = active.or_else(|| TargetCache::get_target_data(txn, &target));
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        TargetCache::get_matching_keys_for_target_id(txn, data.target_id),
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let view = LocalDocumentsView::new(queue, overlays);
                let documents = if use_previous_results {
                    engine.get_documents_matching_query(txn, &view, query, last_limbo_free, &remote_keys)?
                } else {
                    engine.get_documents_matching_query(
                        txn,
                        &view,
                        query,
                        SnapshotVersion::min(),
                        &BTreeSet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
            .await
    }

    pub async fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let mut guard = self.state.lock().await;
        guard
            .runner
            .run_transaction("remote_document_keys", |txn| {
                Ok(TargetCache::get_matching_keys_for_target_id(txn, target_id))
            })
            .await
    }

    /// The local view of one document.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let view = LocalDocumentsView::new(&state.mutation_queue, &state.overlay_cache);
        state
            .runner
            .run_transaction("read_document", |txn| Ok(view.get_document(txn, key)))
            .await
    }

    pub async fn get_documents(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let view = LocalDocumentsView::new(&state.mutation_queue, &state.overlay_cache);
        state
            .runner
            .run_transaction("get_documents", |txn| view.get_documents(txn, keys))
            .await
    }

    /// Local view of documents matching `query` changed after `since`.
    pub async fn get_documents_matching_query(
        &self,
        query: &Query,
        since: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let view = LocalDocumentsView::new(&state.mutation_queue, &state.overlay_cache);
        state
            .runner
            .run_transaction("get_documents_matching_query", |txn| {
                let mut context = Default::default();
                Ok(view.get_documents_matching_query(txn, query, since, &mut context))
            })
            .await
    }

    /// Replaces the configured field indexes. Indexes already present with
    /// the same definition keep their entries.
    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let mut guard = self.state.lock().await;
        guard
            .runner
            .run_transaction("configure_field_indexes", |txn| {
                let existing = IndexManager::field_indexes(txn, None);
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.same_definition(index)) {
                        IndexManager::delete_field_index(txn, index.index_id);
                    }
                }
                for index in indexes {
                    if !existing.iter().any(|current| current.same_definition(&index)) {
                        IndexManager::add_field_index(txn, index);
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn field_indexes(&self) -> FirestoreResult<Vec<FieldIndex>> {
        let mut guard = self.state.lock().await;
        guard
            .runner
            .run_transaction("field_indexes", |txn| Ok(IndexManager::field_indexes(txn, None)))
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.state
            .lock()
            .await
            .query_engine
            .set_index_auto_creation_enabled(enabled);
    }

    /// Drops cached documents no target, view or pending write refers to.
    /// Returns the keys removed.
    pub async fn collect_garbage(&self) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let collector = collector!(state);
        let queue = &state.mutation_queue;
        let removed = state
            .runner
            .run_transaction("collect_garbage", |txn| {
                let candidates: BTreeSet<DocumentKey> = txn
                    .remote_documents()
                    .scan_all()
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                Ok(collector.collect(txn, queue, candidates))
            })
            .await?;
        state.orphaned_documents.clear();
        Ok(removed)
    }
}
