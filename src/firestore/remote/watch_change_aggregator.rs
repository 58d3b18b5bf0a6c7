//! Folds listen stream messages into per-target deltas until the backend
//! reports a consistent snapshot, then drains them as one [`RemoteEvent`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;

use crate::firestore::core::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::{BloomFilter, BloomFilterApplicationStatus};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets it does not own.
#[async_trait]
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local cache currently associates with `target_id`.
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` when the client no longer listens to `target_id`.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Listen and unlisten requests the backend has not answered yet.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A new target always produces a first change, even when empty.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                ChangeKind::Added => &mut change.added_documents,
                ChangeKind::Modified => &mut change.modified_documents,
                ChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: ChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        if self.pending_responses < 0 {
            log::error!("target received more responses than requests");
            self.pending_responses = 0;
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

pub struct WatchChangeAggregator {
    /// `projects/{p}/databases/{d}/documents/`, the prefix bloom filters hash.
    document_name_prefix: String,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_name: &str) -> Self {
        Self {
            document_name_prefix: format!("{database_name}/documents/"),
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub async fn handle_document_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentWatchChange,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(provider, *target_id, document.clone())
                        .await;
                }
                other => {
                    self.remove_document_from_target(
                        provider,
                        *target_id,
                        change.key.clone(),
                        other.clone(),
                    )
                    .await;
                }
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                provider,
                *target_id,
                change.key.clone(),
                change.new_doc.clone(),
            )
            .await;
        }
    }

    pub async fn handle_target_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        for target_id in self.affected_targets(provider, change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A new listen replaces whatever a previous one left.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    if change.cause.is_some() {
                        log::warn!("target {target_id} removal with a cause reached the aggregator");
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        // Everything accumulated so far is discarded and the
                        // target resyncs from an empty state.
                        self.reset_target(provider, target_id).await;
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Targets named by `change`, or every active target when it names none.
    fn affected_targets(
        &self,
        provider: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut targets: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect();
        targets.sort_unstable();
        targets
    }

    pub async fn handle_existence_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: ExistenceFilterChange,
    ) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document is gone; a miss for a document target is
                // always a deletion.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(provider, target_id, key, Some(deleted))
                        .await;
                }
            } else if expected_count != 1 {
                log::error!(
                    "single document existence filter for target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id).await;
        if current_count == i64::from(expected_count) {
            return;
        }

        let status = self
            .apply_bloom_filter(provider, &change, current_count)
            .await;
        log::debug!(
            "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}, bloom filter {status:?}"
        );
        let purpose = match status {
            // Stale keys are already removed; the target stays live.
            BloomFilterApplicationStatus::Success => return,
            BloomFilterApplicationStatus::FalsePositive => TargetPurpose::ExistenceFilterMismatchBloom,
            BloomFilterApplicationStatus::Skipped => TargetPurpose::ExistenceFilterMismatch,
        };
        self.reset_target(provider, target_id).await;
        self.pending_target_resets.insert(target_id, purpose);
    }

    async fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplicationStatus {
        let Some(proto) = &change.existence_filter.unchanged_names else {
            return BloomFilterApplicationStatus::Skipped;
        };
        let bloom_filter =
            match BloomFilter::new(proto.bitmap.clone(), proto.padding, proto.hash_count) {
                Ok(filter) => filter,
                Err(err) => {
                    log::warn!("applying bloom filter failed: {err}");
                    return BloomFilterApplicationStatus::Skipped;
                }
            };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplicationStatus::Skipped;
        }

        let removed = self
            .filter_removed_documents(provider, &bloom_filter, change.target_id)
            .await;
        if i64::from(change.existence_filter.count) != current_count - removed {
            BloomFilterApplicationStatus::FalsePositive
        } else {
            BloomFilterApplicationStatus::Success
        }
    }

    /// Removes every cached key of the target that the bloom filter rules
    /// out, returning how many were removed.
    async fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id).await {
            let name = format!("{}{}", self.document_name_prefix, key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, key, None)
                    .await;
                removed += 1;
            }
        }
        removed
    }

    /// Drains everything accumulated so far into one event at
    /// `snapshot_version`.
    pub async fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current single-document target that never mentioned its
                // document is proof that the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let updated = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated && !self.target_contains_document(provider, target_id, &key).await {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, key, Some(deleted))
                            .await;
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents only referenced by limbo targets are tracked separately
        // so garbage collection can treat them specially.
        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    async fn add_document_to_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: MutableDocument,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(provider, target_id, &key).await {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// `updated_document` is the document's new state when known, or `None`
    /// when it merely left the target.
    async fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        if self.target_contains_document(provider, target_id, &key).await {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), ChangeKind::Removed);
        } else {
            // The document was never synced to this target; forget a
            // pending add instead of reporting a removal.
            self.ensure_target_state(target_id)
                .remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Counts a listen or unlisten request whose acknowledgement is pending.
    /// Changes for the target are ignored until every request is answered.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    async fn current_document_count_for_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = provider.get_remote_keys_for_target(target_id).await.len() as i64;
        remote + change.added_documents.len() as i64 - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let active = self
            .target_data_for_active_target(provider, target_id)
            .is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    async fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        // Cached documents are reported removed unless the backend sends
        // them again before the next snapshot.
        for key in provider.get_remote_keys_for_target(target_id).await {
            self.remove_document_from_target(provider, target_id, key, None)
                .await;
        }
    }

    async fn target_contains_document(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        provider
            .get_remote_keys_for_target(target_id)
            .await
            .contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::model::{ResourcePath, Timestamp};
    use crate::firestore::remote::watch_change::{BloomFilterProto, ExistenceFilter};
    use crate::firestore::value::MapValue;
    use md5::{Digest, Md5};
    use std::sync::Mutex;

    const DATABASE: &str = "projects/p/databases/(default)";

    #[derive(Default)]
    struct FakeProvider {
        targets: Mutex<HashMap<TargetId, TargetData>>,
        remote_keys: Mutex<HashMap<TargetId, BTreeSet<DocumentKey>>>,
    }

    impl FakeProvider {
        fn with_target(self, target_id: TargetId, query: Query, purpose: TargetPurpose) -> Self {
            self.targets.lock().unwrap().insert(
                target_id,
                TargetData::new(query.to_target(), target_id, purpose, 1),
            );
            self
        }

        fn with_remote_keys(self, target_id: TargetId, keys: &[&str]) -> Self {
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }
    }

    #[async_trait]
    impl TargetMetadataProvider for FakeProvider {
        async fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn collection(path: &str) -> Query {
        Query::new(ResourcePath::from_string(path).unwrap())
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(seconds), version(seconds), MapValue::empty())
    }

    fn doc_change(updated: &[TargetId], removed: &[TargetId], document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated.to_vec(),
            removed_target_ids: removed.to_vec(),
            key: document.key().clone(),
            new_doc: Some(document),
        }
    }

    fn target_change(state: WatchTargetChangeState, ids: &[TargetId], token: &[u8]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids: ids.to_vec(),
            resume_token: token.to_vec(),
            cause: None,
        }
    }

    #[tokio::test]
    async fn added_documents_are_reported_once_current() {
        let provider = FakeProvider::default().with_target(2, collection("c"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator.record_pending_target_request(2);

        aggregator
            .handle_target_change(&provider, &target_change(WatchTargetChangeState::Added, &[2], &[]))
            .await;
        aggregator
            .handle_document_change(&provider, doc_change(&[2], &[], found("c/a", 1)))
            .await;
        aggregator
            .handle_target_change(&provider, &target_change(WatchTargetChangeState::Current, &[2], b"t1"))
            .await;

        let event = aggregator.create_remote_event(&provider, version(2)).await;
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1".to_vec());
        assert_eq!(change.added_documents, BTreeSet::from([key("c/a")]));
        assert_eq!(event.document_updates[&key("c/a")].read_time(), version(2));
        assert!(event.resolved_limbo_documents.is_empty());

        // Draining leaves nothing behind.
        let next = aggregator.create_remote_event(&provider, version(3)).await;
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[tokio::test]
    async fn changes_for_pending_targets_are_ignored() {
        let provider = FakeProvider::default().with_target(2, collection("c"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator.record_pending_target_request(2);
        aggregator
            .handle_document_change(&provider, doc_change(&[2], &[], found("c/a", 1)))
            .await;
        let event = aggregator.create_remote_event(&provider, version(2)).await;
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[tokio::test]
    async fn known_documents_are_modified_and_removed() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a", "c/b"]);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator
            .handle_document_change(&provider, doc_change(&[2], &[], found("c/a", 3)))
            .await;
        aggregator
            .handle_document_change(
                &provider,
                DocumentWatchChange {
                    updated_target_ids: vec![],
                    removed_target_ids: vec![2],
                    key: key("c/b"),
                    new_doc: None,
                },
            )
            .await;

        let event = aggregator.create_remote_event(&provider, version(4)).await;
        let change = &event.target_changes[&2];
        assert_eq!(change.modified_documents, BTreeSet::from([key("c/a")]));
        assert_eq!(change.removed_documents, BTreeSet::from([key("c/b")]));
        assert!(!event.document_updates.contains_key(&key("c/b")));
    }

    #[tokio::test]
    async fn reset_discards_accumulated_state() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a"]);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator
            .handle_document_change(&provider, doc_change(&[2], &[], found("c/new", 3)))
            .await;
        aggregator
            .handle_target_change(&provider, &target_change(WatchTargetChangeState::Reset, &[2], &[]))
            .await;

        let event = aggregator.create_remote_event(&provider, version(4)).await;
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert_eq!(change.removed_documents, BTreeSet::from([key("c/a")]));
        assert!(!change.current);
    }

    #[tokio::test]
    async fn mismatched_count_without_bloom_filter_resets_target() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a", "c/b"]);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator
            .handle_existence_filter(
                &provider,
                ExistenceFilterChange {
                    target_id: 2,
                    existence_filter: ExistenceFilter {
                        count: 1,
                        unchanged_names: None,
                    },
                },
            )
            .await;

        let event = aggregator.create_remote_event(&provider, version(5)).await;
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[tokio::test]
    async fn matching_count_is_a_no_op() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a"]);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator.create_remote_event(&provider, version(1)).await;
        aggregator
            .handle_existence_filter(
                &provider,
                ExistenceFilterChange {
                    target_id: 2,
                    existence_filter: ExistenceFilter {
                        count: 1,
                        unchanged_names: None,
                    },
                },
            )
            .await;
        let event = aggregator.create_remote_event(&provider, version(5)).await;
        assert!(event.target_mismatches.is_empty());
    }

    /// Bitmap of a 16 byte, 3 hash bloom filter holding `paths`.
    fn bloom_bitmap(paths: &[&str]) -> BloomFilterProto {
        let bytes = 16;
        let hash_count = 3u32;
        let bit_count = bytes as u64 * 8;
        let mut bitmap = vec![0u8; bytes];
        for path in paths {
            let digest = Md5::digest(format!("{DATABASE}/documents/{path}").as_bytes());
            let hash1 = u64::from_le_bytes(digest[..8].try_into().unwrap());
            let hash2 = u64::from_le_bytes(digest[8..].try_into().unwrap());
            for index in 0..hash_count {
                let bit = hash1.wrapping_add(hash2.wrapping_mul(index as u64)) % bit_count;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        BloomFilterProto {
            bitmap,
            padding: 0,
            hash_count: hash_count as i32,
        }
    }

    async fn apply_filter(
        aggregator: &mut WatchChangeAggregator,
        provider: &FakeProvider,
        count: i32,
        unchanged_names: BloomFilterProto,
    ) {
        aggregator
            .handle_existence_filter(
                provider,
                ExistenceFilterChange {
                    target_id: 2,
                    existence_filter: ExistenceFilter {
                        count,
                        unchanged_names: Some(unchanged_names),
                    },
                },
            )
            .await;
    }

    #[tokio::test]
    async fn bloom_filter_removes_only_stale_documents() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a", "c/b"]);
        let proto = bloom_bitmap(&["c/a"]);
        let filter = BloomFilter::new(proto.bitmap.clone(), 0, proto.hash_count).unwrap();
        // The test relies on c/b hashing outside the filter.
        assert!(!filter.might_contain(&format!("{DATABASE}/documents/c/b")));

        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        apply_filter(&mut aggregator, &provider, 1, proto).await;

        let event = aggregator.create_remote_event(&provider, version(5)).await;
        // The target keeps its resume token; no re-listen is needed.
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents, BTreeSet::from([key("c/b")]));
        assert!(change.added_documents.is_empty());
    }

    #[tokio::test]
    async fn bloom_filter_false_positive_resets_target() {
        let provider = FakeProvider::default()
            .with_target(2, collection("c"), TargetPurpose::Listen)
            .with_remote_keys(2, &["c/a", "c/b"]);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        // Both keys pass the filter, yet only one document remains.
        apply_filter(&mut aggregator, &provider, 1, bloom_bitmap(&["c/a", "c/b"])).await;

        let event = aggregator.create_remote_event(&provider, version(5)).await;
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[tokio::test]
    async fn current_document_target_without_document_synthesizes_delete() {
        let limbo_key = key("c/gone");
        let provider = FakeProvider::default().with_target(
            3,
            Query::for_document(&limbo_key),
            TargetPurpose::LimboResolution,
        );
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator
            .handle_target_change(&provider, &target_change(WatchTargetChangeState::Current, &[3], b"t"))
            .await;

        let event = aggregator.create_remote_event(&provider, version(7)).await;
        let document = &event.document_updates[&limbo_key];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(7));
        assert!(event.resolved_limbo_documents.contains(&limbo_key));
    }

    #[tokio::test]
    async fn global_no_change_updates_tokens_of_active_targets() {
        let provider = FakeProvider::default()
            .with_target(2, collection("a"), TargetPurpose::Listen)
            .with_target(4, collection("b"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(DATABASE);
        aggregator.create_remote_event(&provider, version(1)).await;
        aggregator
            .handle_document_change(&provider, doc_change(&[2, 4], &[], found("a/x", 1)))
            .await;
        aggregator.create_remote_event(&provider, version(2)).await;

        aggregator
            .handle_target_change(&provider, &target_change(WatchTargetChangeState::NoChange, &[], b"g"))
            .await;
        let event = aggregator.create_remote_event(&provider, version(3)).await;
        assert_eq!(event.target_changes[&2].resume_token, b"g".to_vec());
        assert_eq!(event.target_changes[&4].resume_token, b"g".to_vec());
    }
}
