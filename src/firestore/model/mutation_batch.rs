use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, MutableDocument, Mutation, MutationResult,
    OverlayedDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::FieldMask;
use crate::util::hard_assert;

/// Batch id used before any batch has been written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations submitted together by one local write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Patches pinning the base values of non-idempotent transforms. Applied
    /// locally before `mutations` and never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged writes for `document.key()` to the cached
    /// remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        hard_assert(
            result.mutation_results.len() == self.mutations.len(),
            format!(
                "mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                result.mutation_results.len()
            ),
        )?;
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result)?;
            }
        }
        Ok(())
    }

    /// Applies every mutation of this batch that targets `document.key()` to
    /// the local view, threading the mutated-field mask through.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to a set of overlayed documents and returns the
    /// resulting overlay mutation per key.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mask = overlayed.mutated_fields.take();
            let mut mask = self.apply_to_local_view(&mut overlayed.document, mask);
            if documents_without_remote_version.contains(&key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mask;
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }
}

/// A batch together with the backend's response to it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document had right after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        )?;
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
