use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{
    DocumentKey, FieldPath, FieldTransform, MutableDocument, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::firestore::value::{FieldMask, FirestoreValue, MapValue};
use crate::util::hard_assert;

/// Condition the target document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the fields named by `mask`; masked fields missing from `data`
    /// are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing. Only sent by transactions.
    Verify,
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// The backend's answer for one mutation of a committed batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::from_parts(key, MutationKind::Set { value }, Precondition::None)
    }

    /// An update of existing fields; fails remotely if the document is missing.
    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self::from_parts(
            key,
            MutationKind::Patch { data, mask },
            Precondition::Exists(true),
        )
    }

    /// A set-with-merge: writes the masked fields and creates the document
    /// when it does not exist.
    pub fn merge(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self::from_parts(key, MutationKind::Patch { data, mask }, Precondition::None)
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::from_parts(key, MutationKind::Delete, Precondition::None)
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::from_parts(key, MutationKind::Verify, precondition)
    }

    pub fn from_parts(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Fields written by a patch; `None` for mutations that replace or
    /// remove the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.clone()),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` is the set of fields mutated by earlier local writes,
    /// with `None` meaning the whole document was replaced. Returns the mask
    /// after this mutation.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                for (path, result) in transform_results {
                    data.set(&path, result);
                }
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data: patch, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                data.apply_mask_from(mask, patch);
                for (path, result) in transform_results {
                    data.set(&path, result);
                }
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();

                let mut merged = previous_mask?;
                merged.extend(mask);
                for transform in &self.field_transforms {
                    merged.insert(transform.field_path().clone());
                }
                Some(merged)
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(result)?;
                let mut data = value.clone();
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data: patch, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The patch was applied to a document we have not seen.
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(result)?;
                let mut data = document.data().clone();
                data.apply_mask_from(mask, patch);
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
        Ok(())
    }

    /// Values pinned at write time for transforms that are not idempotent,
    /// or `None` when the mutation has none.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in &self.field_transforms {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field_path(), value);
            }
        }
        base
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        result: &MutationResult,
    ) -> FirestoreResult<Vec<(FieldPath, FirestoreValue)>> {
        hard_assert(
            result.transform_results.len() == self.field_transforms.len(),
            format!(
                "server transform result count ({}) should match field transform count ({})",
                result.transform_results.len(),
                self.field_transforms.len()
            ),
        )?;
        Ok(self
            .field_transforms
            .iter()
            .zip(result.transform_results.iter())
            .map(|(transform, value)| (transform.field_path().clone(), value.clone()))
            .collect())
    }
}

/// Collapses the local mutations already applied to `document` into a single
/// overlay mutation. `mask` is the accumulated mask from
/// [`Mutation::apply_to_local_view`]; `None` means the whole document.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };
    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut overlay_mask = FieldMask::default();
    for path in mask.paths() {
        if overlay_mask.covers(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.get(&path);
        // A deleted nested field is represented by its parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.get(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        overlay_mask.insert(path);
    }
    Some(Mutation::merge(document.key().clone(), patch, overlay_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("c/1").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut fields = BTreeMap::new();
        for (name, value) in entries {
            fields.insert(name.to_string(), value.clone());
        }
        MapValue::new(fields)
    }

    fn path(dotted: &str) -> FieldPath {
        FieldPath::from_dot_separated(dotted).unwrap()
    }

    fn found(data: MapValue) -> MutableDocument {
        MutableDocument::new_found_document(key(), version(1), version(1), data)
    }

    #[test]
    fn set_replaces_document_and_clears_mask() {
        let mut doc = found(map(&[("a", FirestoreValue::from_integer(1))]));
        let mutation = Mutation::set(key(), map(&[("b", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.field(&path("a")).is_none());
        assert_eq!(doc.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::from_paths([path("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(doc.is_no_document());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn patch_extends_mask_with_transforms() {
        let mut doc = found(map(&[("a", FirestoreValue::from_integer(1))]));
        let mutation = Mutation::patch(
            key(),
            map(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::from_paths([path("b")]),
        )
        .with_transform(path("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(3)));
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::now())
            .unwrap();
        assert!(mask.covers(&path("b")));
        assert!(mask.covers(&path("n")));
        assert_eq!(doc.field(&path("n")), Some(&FirestoreValue::from_integer(3)));
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::default());
        mutation
            .apply_to_remote_document(&mut doc, &MutationResult::new(version(7), Vec::new()))
            .unwrap();
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(7));
    }

    #[test]
    fn acknowledged_transform_uses_server_value() {
        let mut doc = found(MapValue::empty());
        let mutation = Mutation::set(key(), MapValue::empty())
            .with_transform(path("t"), TransformOperation::ServerTimestamp);
        let server_time = FirestoreValue::from_timestamp(Timestamp::new(9, 0));
        mutation
            .apply_to_remote_document(
                &mut doc,
                &MutationResult::new(version(9), vec![server_time.clone()]),
            )
            .unwrap();
        assert_eq!(doc.field(&path("t")), Some(&server_time));
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn mismatched_transform_results_are_an_internal_error() {
        let mut doc = found(MapValue::empty());
        let mutation = Mutation::set(key(), MapValue::empty())
            .with_transform(path("t"), TransformOperation::ServerTimestamp);
        let err = mutation
            .apply_to_remote_document(&mut doc, &MutationResult::new(version(9), Vec::new()))
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Internal);
    }

    #[test]
    fn overlay_for_deleted_nested_field_uses_parent() {
        let mut doc = found(map(&[(
            "a",
            FirestoreValue::from_map(BTreeMap::from([(
                "b".to_string(),
                FirestoreValue::from_integer(1),
            )])),
        )]));
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::from_paths([path("a.b")]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::now());

        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay.kind() {
            MutationKind::Patch { mask, data } => {
                assert!(mask.covers(&path("a")));
                assert!(data.get(&path("a")).is_some());
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn overlay_for_delete_is_delete() {
        let mut doc = found(MapValue::empty());
        let mask = Mutation::delete(key()).apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }

    #[test]
    fn base_value_pins_increment_operand() {
        let doc = found(map(&[("n", FirestoreValue::from_integer(4))]));
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::default())
            .with_transform(path("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)));
        let base = mutation.extract_transform_base_value(&doc).unwrap();
        assert_eq!(base.get(&path("n")), Some(&FirestoreValue::from_integer(4)));
    }
}
