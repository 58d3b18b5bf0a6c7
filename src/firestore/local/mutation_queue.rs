use std::collections::BTreeSet;

use crate::firestore::core::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{MutationQueueMetadata, PersistenceTransaction};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::util::hard_assert;

/// Pending mutation batches of one user, in batch id order.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    uid: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            uid: user.storage_key(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn batch_range(&self) -> std::ops::RangeInclusive<(String, BatchId)> {
        (self.uid.clone(), BatchId::MIN)..=(self.uid.clone(), BatchId::MAX)
    }

    fn key_range(
        &self,
        key: &DocumentKey,
    ) -> std::ops::RangeInclusive<(String, DocumentKey, BatchId)> {
        (self.uid.clone(), key.clone(), BatchId::MIN)..=(self.uid.clone(), key.clone(), BatchId::MAX)
    }

    pub fn is_empty(&self, txn: &mut PersistenceTransaction<'_>) -> bool {
        txn.mutation_batches().scan(self.batch_range()).is_empty()
    }

    /// Appends a batch under the next batch id. Ids increase across users and
    /// restarts.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), "mutation batches must not be empty")?;
        let mut globals = txn.globals();
        globals.last_batch_id += 1;
        let batch_id = globals.last_batch_id;
        txn.set_globals(globals);

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            txn.document_mutations()
                .put((self.uid.clone(), key, batch_id), ());
        }
        txn.mutation_batches()
            .put((self.uid.clone(), batch_id), batch.clone());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        txn.mutation_batches().get(&(self.uid.clone(), batch_id))
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        let start = batch_id.saturating_add(1);
        txn.mutation_batches()
            .scan((self.uid.clone(), start)..=(self.uid.clone(), BatchId::MAX))
            .into_iter()
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn highest_unacknowledged_batch_id(&self, txn: &mut PersistenceTransaction<'_>) -> BatchId {
        txn.mutation_batches()
            .scan(self.batch_range())
            .last()
            .map(|((_, batch_id), _)| *batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self, txn: &mut PersistenceTransaction<'_>) -> Vec<MutationBatch> {
        txn.mutation_batches()
            .scan(self.batch_range())
            .into_iter()
            .map(|(_, batch)| batch)
            .collect()
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn all_mutation_batches_affecting_document_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> Vec<MutationBatch> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            for ((_, _, batch_id), _) in txn.document_mutations().scan(self.key_range(key)) {
                batch_ids.insert(batch_id);
            }
        }
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(txn, batch_id))
            .collect()
    }

    pub fn contains_key(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        !txn.document_mutations().scan(self.key_range(key)).is_empty()
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let head = txn
            .mutation_batches()
            .scan(self.batch_range())
            .into_iter()
            .next()
            .map(|((_, batch_id), _)| batch_id);
        hard_assert(
            head == Some(batch.batch_id),
            format!(
                "can only remove the first entry of the mutation queue (removing {}, head {:?})",
                batch.batch_id, head
            ),
        )?;
        txn.mutation_batches()
            .delete((self.uid.clone(), batch.batch_id));
        for key in batch.keys() {
            txn.document_mutations()
                .delete((self.uid.clone(), key, batch.batch_id));
        }
        Ok(())
    }

    /// An empty queue must not leave document references behind.
    pub fn perform_consistency_check(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if !self.is_empty(txn) {
            return Ok(());
        }
        let dangling = txn
            .document_mutations()
            .scan_all()
            .into_iter()
            .filter(|((uid, _, _), _)| *uid == self.uid)
            .count();
        hard_assert(
            dangling == 0,
            format!("document leak: {dangling} references remain in an empty mutation queue"),
        )
    }

    pub fn last_stream_token(&self, txn: &mut PersistenceTransaction<'_>) -> Vec<u8> {
        txn.mutation_queues()
            .get(&self.uid)
            .map(|metadata| metadata.last_stream_token)
            .unwrap_or_default()
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, token: Vec<u8>) {
        txn.mutation_queues().put(
            self.uid.clone(),
            MutationQueueMetadata {
                last_stream_token: token,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, TransactionRunner};
    use std::sync::Arc;

    fn delete(path: &str) -> Mutation {
        Mutation::delete(DocumentKey::from_string(path).unwrap())
    }

    #[tokio::test]
    async fn batches_are_removed_in_order() {
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        let queue = MutationQueue::new(&User::new("alice"));
        runner
            .run_transaction("queue", |txn| {
                let first = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![delete("c/a")])?;
                let second = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![delete("c/a")])?;
                assert_eq!(second.batch_id, first.batch_id + 1);
                assert_eq!(queue.highest_unacknowledged_batch_id(txn), second.batch_id);
                assert_eq!(
                    queue
                        .next_mutation_batch_after_batch_id(txn, BATCH_ID_UNKNOWN)
                        .map(|batch| batch.batch_id),
                    Some(first.batch_id)
                );

                assert!(queue.remove_mutation_batch(txn, &second).is_err());
                queue.remove_mutation_batch(txn, &first)?;
                queue.remove_mutation_batch(txn, &second)?;
                assert!(queue.is_empty(txn));
                assert!(!queue.contains_key(txn, &DocumentKey::from_string("c/a").unwrap()));
                queue.perform_consistency_check(txn)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queues_are_isolated_per_user() {
        let mut runner = TransactionRunner::start(Arc::new(MemoryPersistence::new()))
            .await
            .unwrap();
        let alice = MutationQueue::new(&User::new("alice"));
        let bob = MutationQueue::new(&User::new("bob"));
        runner
            .run_transaction("users", |txn| {
                alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![delete("c/a")])?;
                assert!(bob.is_empty(txn));
                assert_eq!(bob.highest_unacknowledged_batch_id(txn), BATCH_ID_UNKNOWN);
                assert_eq!(
                    alice
                        .all_mutation_batches_affecting_document_keys(
                            txn,
                            &[DocumentKey::from_string("c/a").unwrap()]
                        )
                        .len(),
                    1
                );
                Ok(())
            })
            .await
            .unwrap();
    }
}
