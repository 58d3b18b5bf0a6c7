//! The local view of documents: remote state with overlays applied.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::{QueryContext, RemoteDocumentCache};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, MutableDocument, Overlay,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::value::FieldMask;

pub struct LocalDocumentsView<'a> {
    mutation_queue: &'a MutationQueue,
    overlay_cache: &'a DocumentOverlayCache,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(mutation_queue: &'a MutationQueue, overlay_cache: &'a DocumentOverlayCache) -> Self {
        Self {
            mutation_queue,
            overlay_cache,
        }
    }

    /// The local view of `key`; an invalid document when nothing is known.
    pub fn get_document(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        let mut document = RemoteDocumentCache::get_entry(txn, key);
        if let Some(overlay) = self.overlay_cache.get_overlay(txn, key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::default()), Timestamp::now());
        }
        document
    }

    pub fn get_documents<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let documents = RemoteDocumentCache::get_entries(txn, keys);
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed`
    /// have their overlays recalculated first, because a remote change in
    /// existence can flip the preconditions of pending patches.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        Ok(self
            .compute_views(txn, documents, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents)
    /// but also reports the fields each overlay touched.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        self.compute_views(txn, documents, &BTreeSet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlay_cache.get_overlays(txn, documents.keys());
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut recalculate = BTreeSet::new();

        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let patch_or_missing = overlay.map_or(true, |overlay| overlay.mutation.is_patch());
            if existence_state_changed.contains(key) && patch_or_missing {
                recalculate.insert(key.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay
                    .mutation
                    .apply_to_local_view(document, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::default()));
            }
        }

        if !recalculate.is_empty() {
            let mut recalculated: BTreeMap<DocumentKey, MutableDocument> = recalculate
                .iter()
                .filter_map(|key| documents.remove(key).map(|doc| (key.clone(), doc)))
                .collect();
            let masks = self.recalculate_and_save_overlays(txn, &mut recalculated)?;
            for (key, mask) in masks {
                mutated_fields.insert(key, mask);
            }
            documents.extend(recalculated);
        }

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).flatten();
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Replays every pending batch touching `documents` onto them and stores
    /// the resulting overlays. Returns the mutated-field mask per document.
    fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(txn, documents.keys());

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::default()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                documents_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        // Newest batch first; each document is saved once, under the newest
        // batch that touched it.
        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(key), masks.get(key)) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key.clone(), mutation);
                }
            }
            self.overlay_cache.save_overlays(txn, *batch_id, &overlays);
        }
        Ok(masks)
    }

    /// Rebuilds the overlays of `keys` from their cached remote state.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = RemoteDocumentCache::get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Documents matching `query` in the local view. Remote documents read
    /// at or before `since_read_time` are skipped unless they carry an
    /// overlay.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(txn, query);
        }
        let overlays: BTreeMap<DocumentKey, Overlay> = match query.collection_group_id() {
            Some(group) if query.is_collection_group_query() => self
                .overlay_cache
                .get_overlays_for_collection_group(txn, group, BATCH_ID_UNKNOWN),
            _ => self
                .overlay_cache
                .get_overlays_for_collection(txn, query.path(), BATCH_ID_UNKNOWN),
        };
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = RemoteDocumentCache::get_documents_matching_query(
            txn,
            query,
            since_read_time,
            &mutated_keys,
            context,
        );
        for key in &mutated_keys {
            documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let now = Timestamp::now();
        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, Some(FieldMask::default()), now);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut results = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = self.get_document(txn, &key);
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::local::persistence::{MemoryPersistence, TransactionRunner};
    use crate::firestore::model::{FieldPath, Mutation, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(name: &str, value: i64) -> MapValue {
        let mut fields = BTreeMap::new();
        fields.insert(name.to_string(), FirestoreValue::from_integer(value));
        MapValue::new(fields)
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[tokio::test]
    async fn overlays_shape_the_local_view() {
        let user = User::new("alice");
        let queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        runner
            .run_transaction("view", |txn| {
                let remote = MutableDocument::new_found_document(
                    key("c/a"),
                    version(1),
                    version(1),
                    data("a", 1),
                );
                RemoteDocumentCache::add_entry(txn, remote, version(1));

                let patch = Mutation::patch(
                    key("c/a"),
                    data("b", 2),
                    FieldMask::from_paths([FieldPath::from_dot_separated("b").unwrap()]),
                );
                let batch = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![patch])?;
                let view = LocalDocumentsView::new(&queue, &overlays);
                let keys: BTreeSet<_> = batch.keys();
                view.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;

                let document = view.get_document(txn, &key("c/a"));
                assert!(document.has_local_mutations());
                assert_eq!(
                    document.field(&FieldPath::from_dot_separated("a").unwrap()),
                    Some(&FirestoreValue::from_integer(1))
                );
                assert_eq!(
                    document.field(&FieldPath::from_dot_separated("b").unwrap()),
                    Some(&FirestoreValue::from_integer(2))
                );

                let query = Query::new(ResourcePath::from_string("c").unwrap());
                let mut context = QueryContext::default();
                let results = view.get_documents_matching_query(txn, &query, version(5), &mut context);
                assert_eq!(results.len(), 1, "overlayed documents bypass the read-time filter");
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn set_on_missing_document_creates_it_locally() {
        let user = User::unauthenticated();
        let queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        runner
            .run_transaction("set", |txn| {
                let set = Mutation::set(key("c/new"), data("x", 1));
                let batch = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set])?;
                let view = LocalDocumentsView::new(&queue, &overlays);
                view.recalculate_and_save_overlays_for_document_keys(txn, &batch.keys())?;

                let query = Query::new(ResourcePath::from_string("c").unwrap());
                let results = view.get_documents_matching_query(
                    txn,
                    &query,
                    SnapshotVersion::min(),
                    &mut QueryContext::default(),
                );
                assert!(results[&key("c/new")].is_found_document());
                Ok(())
            })
            .await
            .unwrap();
    }
}
