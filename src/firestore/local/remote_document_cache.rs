use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Counters collected while executing a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

/// Last known server state of each document.
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        txn.remote_documents()
            .get(key)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'k>(
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.into_iter()
            .map(|key| (key.clone(), Self::get_entry(txn, key)))
            .collect()
    }

    /// Stores `document` stamped with `read_time` and updates index entries.
    pub fn add_entry(
        txn: &mut PersistenceTransaction<'_>,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) {
        let key = document.key().clone();
        document.set_read_time(read_time);
        let previous = txn.remote_documents().get(&key);
        IndexManager::update_index_entries(txn, &key, previous.as_ref(), Some(&document));
        txn.remote_documents().put(key, document);
    }

    pub fn remove_entry(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        let previous = txn.remote_documents().get(key);
        if previous.is_some() {
            IndexManager::update_index_entries(txn, key, previous.as_ref(), None);
            txn.remote_documents().delete(key.clone());
        }
    }

    /// Cached documents that could belong to `query`: those read after
    /// `since_read_time` that match it, plus every key in `mutated_keys`
    /// regardless of content, since a pending write may make them match.
    pub fn get_documents_matching_query(
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let candidates = if query.is_collection_group_query() {
            txn.remote_documents().scan_all()
        } else {
            let path = query.path().clone();
            let start = DocumentKey::range_start(&path);
            txn.remote_documents()
                .scan(start..)
                .into_iter()
                .take_while(|(key, _)| path.is_prefix_of(key.path()))
                .filter(|(key, _)| path.is_immediate_parent_of(key.path()))
                .collect()
        };

        let mut results = BTreeMap::new();
        for (key, document) in candidates {
            if query.is_collection_group_query()
                && query
                    .collection_group_id()
                    .map_or(true, |group| !key.has_collection_id(group))
            {
                continue;
            }
            context.documents_read_count += 1;
            let mutated = mutated_keys.contains(&key);
            if !mutated && !since_read_time.is_min() && document.read_time() <= since_read_time {
                continue;
            }
            if mutated || query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }
}
