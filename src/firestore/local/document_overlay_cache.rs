use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::User;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user overlays, at most one per document.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    uid: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            uid: user.storage_key(),
        }
    }

    pub fn get_overlay(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Option<Overlay> {
        txn.document_overlays().get(&(self.uid.clone(), key.clone()))
    }

    pub fn get_overlays<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.into_iter()
            .filter_map(|key| {
                self.get_overlay(txn, key)
                    .map(|overlay| (key.clone(), overlay))
            })
            .collect()
    }

    /// Stores each mutation as the overlay of its document, tagged with
    /// `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) {
        let mut table = txn.document_overlays();
        for (key, mutation) in overlays {
            table.put(
                (self.uid.clone(), key.clone()),
                Overlay::new(largest_batch_id, mutation.clone()),
            );
        }
    }

    /// Removes the overlays among `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) {
        for key in keys {
            let row = (self.uid.clone(), key.clone());
            let matches = txn
                .document_overlays()
                .get(&row)
                .is_some_and(|overlay| overlay.largest_batch_id == batch_id);
            if matches {
                txn.document_overlays().delete(row);
            }
        }
    }

    /// Overlays for documents directly inside `collection` written by
    /// batches after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = (self.uid.clone(), DocumentKey::range_start(collection));
        txn.document_overlays()
            .scan(start..)
            .into_iter()
            .take_while(|((uid, key), _)| *uid == self.uid && collection.is_prefix_of(key.path()))
            .filter(|((_, key), overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key, overlay))
            .collect()
    }

    pub fn get_overlays_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = (self.uid.clone(), DocumentKey::empty());
        txn.document_overlays()
            .scan(start..)
            .into_iter()
            .take_while(|((uid, _), _)| *uid == self.uid)
            .filter(|((_, key), overlay)| {
                key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key, overlay))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, TransactionRunner};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn overlays_are_scoped_by_collection_and_batch() {
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        let cache = DocumentOverlayCache::new(&User::new("alice"));
        runner
            .run_transaction("overlays", |txn| {
                let mut first = BTreeMap::new();
                first.insert(key("c/a"), Mutation::delete(key("c/a")));
                first.insert(key("c/a/sub/x"), Mutation::delete(key("c/a/sub/x")));
                cache.save_overlays(txn, 1, &first);
                let mut second = BTreeMap::new();
                second.insert(key("c/b"), Mutation::delete(key("c/b")));
                cache.save_overlays(txn, 2, &second);

                let collection = ResourcePath::from_string("c").unwrap();
                assert_eq!(cache.get_overlays_for_collection(txn, &collection, 0).len(), 2);
                assert_eq!(cache.get_overlays_for_collection(txn, &collection, 1).len(), 1);
                assert_eq!(cache.get_overlays_for_collection_group(txn, "sub", 0).len(), 1);

                let keys: BTreeSet<_> = [key("c/a"), key("c/b")].into_iter().collect();
                cache.remove_overlays_for_batch_id(txn, &keys, 1);
                assert!(cache.get_overlay(txn, &key("c/a")).is_none());
                assert!(cache.get_overlay(txn, &key("c/b")).is_some());
                Ok(())
            })
            .await
            .unwrap();
    }
}
