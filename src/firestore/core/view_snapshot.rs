use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::util::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-writes state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes of one snapshot are reported.
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Collapses the changes a view sees for one document into a single change.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                return Err(fail(format!(
                    "unsupported combination of changes {new_type:?} after {old_type:?} for {key}"
                )))
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Documents kept in the result order of a query.
#[derive(Clone)]
pub struct DocumentSet {
    query: Arc<Query>,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(query: Arc<Query>) -> Self {
        Self {
            query,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.query.compare_documents(left, right)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts `document`, replacing any earlier version of it.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let query = Arc::clone(&self.query);
        let position = self
            .sorted
            .binary_search_by(|probe| query.compare_documents(probe, &document))
            .unwrap_or_else(|position| position);
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let removed = self.by_key.remove(key)?;
        let query = Arc::clone(&self.query);
        match self
            .sorted
            .binary_search_by(|probe| query.compare_documents(probe, &removed))
        {
            Ok(position) => {
                self.sorted.remove(position);
            }
            Err(_) => self.sorted.retain(|document| document.key() != key),
        }
        Some(removed)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// What the view of one query looked like at one point, and how it got
/// there from the previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents with writes not yet acknowledged by the backend.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The view was seeded from a resumable target.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot that reports every document as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(Arc::clone(&docs.query));
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// The same snapshot without changes that only touched metadata.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .doc_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}

/// Sorts changes the way snapshots report them: removals, then additions,
/// then modifications, each group in query order.
pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], docs: &DocumentSet) {
    changes.sort_by(|left, right| {
        left.change_type
            .rank()
            .cmp(&right.change_type.rank())
            .then_with(|| docs.compare(&left.document, &right.document))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, n: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(n));
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version,
            version,
            MapValue::new(fields),
        )
    }

    fn change(change_type: ChangeType, document: MutableDocument) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document,
        }
    }

    #[test]
    fn document_set_keeps_query_order() {
        let query = Query::new(ResourcePath::from_string("c").unwrap());
        let mut set = DocumentSet::new(Arc::new(query));
        set.insert(doc("c/b", 1));
        set.insert(doc("c/a", 2));
        set.insert(doc("c/c", 3));
        let keys: Vec<String> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["c/a", "c/b", "c/c"]);

        set.insert(doc("c/b", 9));
        assert_eq!(set.len(), 3);
        assert!(set.remove(&DocumentKey::from_string("c/a").unwrap()).is_some());
        assert_eq!(set.first().unwrap().key().to_string(), "c/b");
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut changes = DocumentChangeSet::new();
        changes.track(change(ChangeType::Added, doc("c/a", 1))).unwrap();
        changes.track(change(ChangeType::Removed, doc("c/a", 1))).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut changes = DocumentChangeSet::new();
        changes.track(change(ChangeType::Removed, doc("c/a", 1))).unwrap();
        changes.track(change(ChangeType::Added, doc("c/a", 2))).unwrap();
        let changes = changes.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn metadata_after_added_keeps_added() {
        let mut changes = DocumentChangeSet::new();
        changes.track(change(ChangeType::Added, doc("c/a", 1))).unwrap();
        changes.track(change(ChangeType::Metadata, doc("c/a", 1))).unwrap();
        assert_eq!(changes.into_changes()[0].change_type, ChangeType::Added);
    }

    #[test]
    fn added_twice_is_an_assertion_failure() {
        let mut changes = DocumentChangeSet::new();
        changes.track(change(ChangeType::Added, doc("c/a", 1))).unwrap();
        assert!(changes.track(change(ChangeType::Added, doc("c/a", 1))).is_err());
    }
}
