use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::persistence::{Persistence, TableDelta, TableSet};

/// Volatile backend: nothing survives the process, and documents are
/// collected as soon as nothing references them.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    failures_remaining: AtomicU32,
    commits: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a transient storage error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of transactions committed so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn start(&self) -> FirestoreResult<TableSet> {
        Ok(TableSet::default())
    }

    async fn commit(&self, _delta: &TableDelta) -> FirestoreResult<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(FirestoreError::transient_storage(
                "simulated storage failure",
            ));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn uses_eager_gc(&self) -> bool {
        true
    }
}
