use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Not yet known; the document may or may not exist.
    Invalid,
    FoundDocument,
    /// Known not to exist at `version`.
    NoDocument,
    /// Known to exist at `version` but with unknown contents, e.g. after a
    /// patch was acknowledged for a document that was not cached.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document that is read and modified in place by the local store.
///
/// The contents are always replaced wholesale through one of the
/// `convert_to_*` methods; callers never patch individual attributes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    fn new(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: MapValue,
        document_state: DocumentState,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::min(),
            create_time,
            data,
            document_state,
        }
    }

    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::new(
            key,
            DocumentType::Invalid,
            SnapshotVersion::min(),
            SnapshotVersion::min(),
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_found_document(
        key: DocumentKey,
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: MapValue,
    ) -> Self {
        Self::new(
            key,
            DocumentType::FoundDocument,
            version,
            create_time,
            data,
            DocumentState::Synced,
        )
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(
            key,
            DocumentType::NoDocument,
            version,
            SnapshotVersion::min(),
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(
            key,
            DocumentType::UnknownDocument,
            version,
            SnapshotVersion::min(),
            MapValue::empty(),
            DocumentState::HasCommittedMutations,
        )
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    /// Local mutations pin the version to the minimum until acknowledged.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

impl PartialEq for MutableDocument {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.version == other.version
            && self.document_type == other.document_type
            && self.document_state == other.document_state
            && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("c/1").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn local_mutations_pin_version_to_min() {
        let mut doc = MutableDocument::new_found_document(key(), version(5), version(1), MapValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.version().is_min());
        assert!(doc.has_pending_writes());
    }

    #[test]
    fn conversions_replace_state() {
        let mut doc = MutableDocument::new_invalid_document(key());
        assert!(!doc.is_valid_document());

        doc.convert_to_found_document(version(2), MapValue::empty());
        assert!(doc.is_found_document());
        assert_eq!(doc.create_time(), version(2));

        doc.convert_to_no_document(version(3));
        assert!(doc.is_no_document());
        assert_eq!(doc.document_state(), DocumentState::Synced);

        doc.convert_to_unknown_document(version(4));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }
}
