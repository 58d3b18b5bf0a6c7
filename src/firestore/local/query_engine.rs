//! Picks the cheapest way to answer a query from the local cache: a field
//! index, the previous result set of the target, or a full collection scan.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::QueryContext;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::settings::SyncSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct QueryEngine {
    index_auto_creation: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: f64,
}

impl QueryEngine {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            index_auto_creation: settings.index_auto_creation,
            index_auto_creation_min_collection_size: settings
                .index_auto_creation_min_collection_size,
            relative_index_read_cost_per_document: settings
                .relative_index_read_cost_per_document,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation = enabled;
    }

    /// Documents matching `query` in the local view. The result may contain
    /// documents beyond the query's limit; views apply the limit.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        if let Some(results) = self.perform_query_using_index(txn, local_documents, query)? {
            return Ok(results);
        }
        if let Some(results) = self.perform_query_using_remote_keys(
            txn,
            local_documents,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        )? {
            return Ok(results);
        }

        let mut context = QueryContext::default();
        let results = local_documents.get_documents_matching_query(
            txn,
            query,
            SnapshotVersion::min(),
            &mut context,
        );
        if self.index_auto_creation {
            self.create_cache_indexes(txn, query, &context, results.len());
        }
        Ok(results)
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        if context.documents_read_count < self.index_auto_creation_min_collection_size {
            log::debug!(
                "skipping index creation for {query}: scanned {} documents, below {}",
                context.documents_read_count,
                self.index_auto_creation_min_collection_size
            );
            return;
        }
        let threshold = self.relative_index_read_cost_per_document * result_size as f64;
        if context.documents_read_count as f64 > threshold {
            log::debug!(
                "creating index for {query}: scanned {} documents for {result_size} results",
                context.documents_read_count
            );
            IndexManager::create_target_indexes(txn, &query.to_target());
        }
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView<'_>,
        query: &Query,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, MutableDocument>>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        let Some(candidates) = IndexManager::documents_matching_target(txn, &target) else {
            return Ok(None);
        };

        let mut results: BTreeMap<DocumentKey, MutableDocument> = local_documents
            .get_documents(txn, &candidates)?
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect();
        // Indexes cover remote state only; pending writes are found through
        // their overlays.
        let mut context = QueryContext::default();
        let overlayed = local_documents.get_documents_matching_query(
            txn,
            query,
            SnapshotVersion::max(),
            &mut context,
        );
        results.extend(overlayed);
        Ok(Some(results))
    }

    /// Reuses the documents the target matched at its last limbo-free
    /// snapshot, adding only documents changed since then.
    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, MutableDocument>>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = local_documents.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }
        log::debug!(
            "re-using previous results from {last_limbo_free_snapshot_version:?} for {query}"
        );

        let mut context = QueryContext::default();
        let mut results = local_documents.get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
            &mut context,
        );
        for document in previous_results {
            results.insert(document.key().clone(), document);
        }
        Ok(Some(results))
    }
}

/// Matching documents in query order, without applying the limit.
fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, MutableDocument>) -> Vec<MutableDocument> {
    let mut results: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| query.compare_documents(left, right));
    results
}

/// Whether a limited query's previous results may be missing documents.
///
/// A document that left the result set may have been replaced by one that
/// was outside the limit, and the cache cannot tell which without a full
/// scan. The same holds when the boundary document has pending writes or
/// changed after the limbo-free snapshot.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{MemoryPersistence, TransactionRunner};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{ResourcePath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), FirestoreValue::from_integer(seconds));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(seconds),
            version(seconds),
            MapValue::new(fields),
        )
    }

    #[test]
    fn limited_query_with_missing_remote_result_needs_refill() {
        let query = Query::new(ResourcePath::from_string("c").unwrap())
            .with_limit(2, LimitType::First);
        let previous = vec![doc("c/a", 1)];
        let remote_keys: BTreeSet<_> = ["c/a", "c/b"]
            .iter()
            .map(|path| DocumentKey::from_string(path).unwrap())
            .collect();
        assert!(needs_refill(&query, &previous, &remote_keys, version(5)));
    }

    #[test]
    fn edge_document_updated_after_snapshot_needs_refill() {
        let query = Query::new(ResourcePath::from_string("c").unwrap())
            .with_limit(1, LimitType::First);
        let remote_keys: BTreeSet<_> = [DocumentKey::from_string("c/a").unwrap()].into_iter().collect();
        assert!(needs_refill(&query, &[doc("c/a", 9)], &remote_keys, version(5)));
        assert!(!needs_refill(&query, &[doc("c/a", 3)], &remote_keys, version(5)));
    }

    #[tokio::test]
    async fn previous_results_are_extended_with_newer_documents() {
        let user = User::unauthenticated();
        let queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let engine = QueryEngine::new(&SyncSettings::default());
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        let results = runner
            .run_transaction("query", |txn| {
                RemoteDocumentCache::add_entry(txn, doc("c/old", 1), version(1));
                RemoteDocumentCache::add_entry(txn, doc("c/stale", 2), version(2));
                RemoteDocumentCache::add_entry(txn, doc("c/new", 10), version(10));
                let view = LocalDocumentsView::new(&queue, &overlays);
                let query = Query::new(ResourcePath::from_string("c").unwrap()).with_filter(
                    crate::firestore::core::Filter::field(
                        crate::firestore::model::FieldPath::from_dot_separated("v").unwrap(),
                        crate::firestore::core::Operator::GreaterThanOrEqual,
                        FirestoreValue::from_integer(0),
                    )?,
                );
                let remote_keys: BTreeSet<_> =
                    [DocumentKey::from_string("c/old").unwrap()].into_iter().collect();
                engine.get_documents_matching_query(txn, &view, &query, version(5), &remote_keys)
            })
            .await
            .unwrap();
        // `c/stale` was read before the snapshot and is not a remote key.
        let keys: Vec<_> = results.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["c/new".to_string(), "c/old".to_string()]);
    }

    #[tokio::test]
    async fn full_scans_create_indexes_when_enabled() {
        let user = User::unauthenticated();
        let queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let settings = SyncSettings::default()
            .with_index_auto_creation(true)
            .with_index_auto_creation_min_collection_size(3);
        let engine = QueryEngine::new(&settings);
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        runner
            .run_transaction("query", |txn| {
                for index in 0..5 {
                    RemoteDocumentCache::add_entry(txn, doc(&format!("c/{index}"), index), version(index));
                }
                let view = LocalDocumentsView::new(&queue, &overlays);
                let query = Query::new(ResourcePath::from_string("c").unwrap()).with_filter(
                    crate::firestore::core::Filter::field(
                        crate::firestore::model::FieldPath::from_dot_separated("v").unwrap(),
                        crate::firestore::core::Operator::Equal,
                        FirestoreValue::from_integer(4),
                    )?,
                );
                let first = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?;
                assert_eq!(first.len(), 1);
                assert_eq!(IndexManager::field_indexes(txn, Some("c")).len(), 1);

                let second = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?;
                assert_eq!(first, second);
                Ok(())
            })
            .await
            .unwrap();
    }
}
