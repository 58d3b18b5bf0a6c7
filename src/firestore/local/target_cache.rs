use std::collections::BTreeSet;

use crate::firestore::core::{Target, TargetData, TargetIdGenerator};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Persisted targets and the documents the backend says match them.
pub struct TargetCache;

impl TargetCache {
    pub fn get_target_data(
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> Option<TargetData> {
        txn.targets()
            .scan_all()
            .into_iter()
            .map(|(_, data)| data)
            .find(|data| data.target.canonical_id() == target.canonical_id())
    }

    pub fn get_target_data_by_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> Option<TargetData> {
        txn.targets().get(&target_id)
    }

    /// Reserves the next query target id.
    pub fn allocate_target_id(txn: &mut PersistenceTransaction<'_>) -> TargetId {
        let mut globals = txn.globals();
        let target_id = TargetIdGenerator::for_target_cache(globals.highest_target_id).next();
        globals.highest_target_id = target_id;
        txn.set_globals(globals);
        target_id
    }

    pub fn add_target_data(txn: &mut PersistenceTransaction<'_>, data: TargetData) {
        Self::note_sequence_number(txn, data.target_id, data.sequence_number);
        txn.targets().put(data.target_id, data);
    }

    pub fn update_target_data(txn: &mut PersistenceTransaction<'_>, data: TargetData) {
        Self::add_target_data(txn, data);
    }

    /// Drops the target together with its matching keys.
    pub fn remove_target_data(txn: &mut PersistenceTransaction<'_>, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let keys = Self::remove_matching_keys_for_target_id(txn, target_id);
        txn.targets().delete(target_id);
        keys
    }

    fn note_sequence_number(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) {
        let mut globals = txn.globals();
        let mut changed = false;
        if target_id > globals.highest_target_id && target_id % 2 == 0 {
            globals.highest_target_id = target_id;
            changed = true;
        }
        if sequence_number > globals.highest_listen_sequence_number {
            globals.highest_listen_sequence_number = sequence_number;
            changed = true;
        }
        if changed {
            txn.set_globals(globals);
        }
    }

    pub fn add_matching_keys<'k>(
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            txn.target_documents().put((target_id, key.clone()), ());
            txn.document_targets().put((key.clone(), target_id), ());
        }
    }

    pub fn remove_matching_keys<'k>(
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            txn.target_documents().delete((target_id, key.clone()));
            txn.document_targets().delete((key.clone(), target_id));
        }
    }

    pub fn remove_matching_keys_for_target_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> BTreeSet<DocumentKey> {
        let keys = Self::get_matching_keys_for_target_id(txn, target_id);
        Self::remove_matching_keys(txn, &keys, target_id);
        keys
    }

    pub fn get_matching_keys_for_target_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> BTreeSet<DocumentKey> {
        txn.target_documents()
            .scan((target_id, DocumentKey::empty())..(target_id + 1, DocumentKey::empty()))
            .into_iter()
            .map(|((_, key), _)| key)
            .collect()
    }

    /// Whether any target still lists `key` as a match.
    pub fn contains_key(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        !txn.document_targets()
            .scan((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .is_empty()
    }

    pub fn last_remote_snapshot_version(txn: &mut PersistenceTransaction<'_>) -> SnapshotVersion {
        txn.globals().last_remote_snapshot_version
    }

    pub fn set_targets_metadata(
        txn: &mut PersistenceTransaction<'_>,
        sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: SnapshotVersion,
    ) {
        let mut globals = txn.globals();
        globals.highest_listen_sequence_number =
            globals.highest_listen_sequence_number.max(sequence_number);
        globals.last_remote_snapshot_version = last_remote_snapshot_version;
        txn.set_globals(globals);
    }

    pub fn target_count(txn: &mut PersistenceTransaction<'_>) -> usize {
        txn.targets().scan_all().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, TargetPurpose};
    use crate::firestore::local::persistence::{MemoryPersistence, TransactionRunner};
    use crate::firestore::model::ResourcePath;
    use std::sync::Arc;

    #[tokio::test]
    async fn allocates_ids_and_tracks_keys() {
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        let target = Query::new(ResourcePath::from_string("c").unwrap()).to_target();
        let key = DocumentKey::from_string("c/a").unwrap();
        runner
            .run_transaction("targets", |txn| {
                let target_id = TargetCache::allocate_target_id(txn);
                assert_eq!(target_id, 2);
                assert_eq!(TargetCache::allocate_target_id(txn), 4);

                let sequence_number = txn.current_sequence_number();
                TargetCache::add_target_data(
                    txn,
                    TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number),
                );
                TargetCache::add_matching_keys(txn, [&key], target_id);
                assert!(TargetCache::contains_key(txn, &key));
                assert_eq!(
                    TargetCache::get_target_data(txn, &target).map(|data| data.target_id),
                    Some(target_id)
                );

                let removed = TargetCache::remove_target_data(txn, target_id);
                assert!(removed.contains(&key));
                assert!(!TargetCache::contains_key(txn, &key));
                assert_eq!(TargetCache::target_count(txn), 0);
                Ok(())
            })
            .await
            .unwrap();
    }
}
