use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// A map of field names to values. Also serves as the data of a document,
/// with helpers to read and write nested fields by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = match current.kind() {
                ValueKind::Map(map) => map.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map value found along the
    /// way with a fresh map.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Copies the fields named by `mask` from `source`; masked fields absent
    /// from `source` are deleted.
    pub fn apply_mask_from(&mut self, mask: &FieldMask, source: &MapValue) {
        for path in mask.paths() {
            match source.get(path) {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }

    /// Field mask covering every leaf field. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = BTreeSet::new();
        collect_leaf_paths(&self.fields, None, &mut paths);
        FieldMask::new(paths)
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.fields,
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(_)) = fields.get(first).map(FirestoreValue::kind) {
        if let Some(ValueKind::Map(map)) = fields.remove(first).map(FirestoreValue::into_kind) {
            let mut child = map.fields;
            delete_at_segments(&mut child, rest);
            fields.insert(first.clone(), FirestoreValue::from_map(child));
        }
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    parent: Option<&FieldPath>,
    out: &mut BTreeSet<FieldPath>,
) {
    for (name, value) in fields {
        let path = match parent {
            Some(parent) => parent.child(name.clone()),
            None => FieldPath::from_segment(name.clone()),
        };
        match value.kind() {
            ValueKind::Map(map) if !map.fields.is_empty() => {
                collect_leaf_paths(&map.fields, Some(&path), out)
            }
            _ => {
                out.insert(path);
            }
        }
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask {
    paths: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(paths: BTreeSet<FieldPath>) -> Self {
        Self { paths }
    }

    pub fn from_paths<I: IntoIterator<Item = FieldPath>>(paths: I) -> Self {
        Self::new(paths.into_iter().collect())
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.paths.insert(path);
    }

    pub fn extend(&mut self, other: &FieldMask) {
        self.paths.extend(other.paths.iter().cloned());
    }

    /// True if `path` is covered by one of the mask's paths.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|candidate| candidate.is_prefix_of(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn set_and_get_nested() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(map.get(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.get(&path("a.x")).is_none());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn delete_nested_field() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("a.c"), FirestoreValue::from_integer(2));
        map.delete(&path("a.b"));
        assert!(map.get(&path("a.b")).is_none());
        assert!(map.get(&path("a.c")).is_some());
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("c"), FirestoreValue::from_integer(2));
        let mask = map.field_mask();
        let paths: Vec<String> = mask.paths().map(|p| p.canonical_string()).collect();
        assert_eq!(paths, vec!["a.b", "c"]);
        assert!(mask.covers(&path("a.b.z")));
    }
}
