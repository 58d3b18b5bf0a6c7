//! Client-side field indexes over the remote document cache.
//!
//! Entries are kept in step with every remote document write, and lookups
//! return a superset of the matching keys; callers re-check the query.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::firestore::core::query::{document_field_value, FieldFilter, Operator};
use crate::firestore::core::Target;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, FieldIndex, IndexKind, IndexSegment, MutableDocument};
use crate::firestore::value::{
    encode_index_value, successor_of_prefix, FirestoreValue, IndexValueWriter,
};

type EntryKey = (i32, Vec<u8>, DocumentKey);

pub struct IndexManager;

impl IndexManager {
    /// Registers `index` under a fresh id and backfills it from the cache.
    pub fn add_field_index(txn: &mut PersistenceTransaction<'_>, index: FieldIndex) -> FieldIndex {
        let next_id = txn
            .field_indexes()
            .scan_all()
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        let index = index.with_id(next_id);
        txn.field_indexes().put(next_id, index.clone());

        let mut backfilled = 0usize;
        for (key, document) in txn.remote_documents().scan_all() {
            if !key.has_collection_id(&index.collection_group) {
                continue;
            }
            for entry in encode_entries(&index, &document) {
                txn.index_entries().put((next_id, entry, key.clone()), ());
                backfilled += 1;
            }
        }
        log::debug!(
            "created index {next_id} on '{}' with {backfilled} entries",
            index.collection_group
        );
        index
    }

    pub fn delete_field_index(txn: &mut PersistenceTransaction<'_>, index_id: i32) {
        txn.field_indexes().delete(index_id);
        let entries = txn.index_entries().scan(index_range(index_id, None, None));
        let mut table = txn.index_entries();
        for (entry, _) in entries {
            table.delete(entry);
        }
    }

    pub fn field_indexes(
        txn: &mut PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> Vec<FieldIndex> {
        txn.field_indexes()
            .scan_all()
            .into_iter()
            .map(|(_, index)| index)
            .filter(|index| {
                collection_group.map_or(true, |group| index.collection_group == group)
            })
            .collect()
    }

    /// Moves the entries of one document from `previous` to `current`.
    pub fn update_index_entries(
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
        previous: Option<&MutableDocument>,
        current: Option<&MutableDocument>,
    ) {
        for index in Self::field_indexes(txn, Some(key.collection_group())) {
            let before: BTreeSet<Vec<u8>> = previous
                .map(|document| encode_entries(&index, document))
                .unwrap_or_default();
            let after: BTreeSet<Vec<u8>> = current
                .map(|document| encode_entries(&index, document))
                .unwrap_or_default();
            let mut table = txn.index_entries();
            for stale in before.difference(&after) {
                table.delete((index.index_id, stale.clone(), key.clone()));
            }
            for fresh in after.difference(&before) {
                table.put((index.index_id, fresh.clone(), key.clone()), ());
            }
        }
    }

    /// Candidate keys for `target` from the first index that can serve one
    /// of its filters, or `None` when no index applies.
    pub fn documents_matching_target(
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> Option<BTreeSet<DocumentKey>> {
        if target.is_document_target() || !target.filters().iter().all(|f| f.is_conjunction()) {
            return None;
        }
        let filters: Vec<&FieldFilter> = target
            .filters()
            .iter()
            .flat_map(|filter| filter.flattened())
            .collect();
        let group = target.collection_group_id();

        for index in Self::field_indexes(txn, Some(&group)) {
            if !covers_target(&index, &filters, target) {
                continue;
            }
            let Some(ranges) = lookup_ranges(&index, &filters) else {
                continue;
            };
            let mut keys = BTreeSet::new();
            for range in ranges {
                for ((_, _, key), _) in txn.index_entries().scan(range) {
                    if target.collection_group().is_some()
                        || key.collection_path() == *target.path()
                    {
                        keys.insert(key);
                    }
                }
            }
            log::debug!(
                "index {} served target {} with {} candidates",
                index.index_id,
                target.canonical_id(),
                keys.len()
            );
            return Some(keys);
        }
        None
    }

    /// Creates an index covering the filters and ordering of `target` unless
    /// an equivalent one already exists.
    pub fn create_target_indexes(txn: &mut PersistenceTransaction<'_>, target: &Target) {
        if target.is_document_target() || !target.filters().iter().all(|f| f.is_conjunction()) {
            return;
        }
        let filters: Vec<&FieldFilter> = target
            .filters()
            .iter()
            .flat_map(|filter| filter.flattened())
            .collect();

        let mut segments = Vec::new();
        if let Some(filter) = filters
            .iter()
            .find(|f| matches!(f.op(), Operator::ArrayContains | Operator::ArrayContainsAny))
        {
            segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Contains));
        }
        let mut seen = BTreeSet::new();
        let equality = filters
            .iter()
            .filter(|f| matches!(f.op(), Operator::Equal | Operator::In))
            .map(|f| f.field());
        let inequality = filters
            .iter()
            .filter(|f| f.op().is_inequality())
            .map(|f| f.field());
        let ordering = target.order_by().iter().map(|order| &order.field);
        for field in equality.chain(inequality).chain(ordering) {
            if !field.is_key_field() && seen.insert(field.clone()) {
                segments.push(IndexSegment::new(field.clone(), IndexKind::Ascending));
            }
        }
        if segments.is_empty() {
            return;
        }

        let index = FieldIndex::new(target.collection_group_id(), segments);
        let exists = Self::field_indexes(txn, Some(&index.collection_group))
            .iter()
            .any(|existing| existing.same_definition(&index));
        if !exists {
            Self::add_field_index(txn, index);
        }
    }
}

/// Index keys for `document`: one per array element when the index has an
/// array segment, none when an indexed field is missing.
fn encode_entries(index: &FieldIndex, document: &MutableDocument) -> BTreeSet<Vec<u8>> {
    let mut entries = BTreeSet::new();
    if !document.is_found_document() {
        return entries;
    }
    let mut writer = IndexValueWriter::new();
    for segment in index.directional_segments() {
        match document_field_value(document, &segment.field_path) {
            Some(value) => writer.write_value(&value),
            None => return entries,
        }
    }
    let directional = writer.finish();

    match index.array_segment() {
        None => {
            entries.insert(directional);
        }
        Some(segment) => {
            let Some(array) = document
                .field(&segment.field_path)
                .and_then(FirestoreValue::as_array)
            else {
                return entries;
            };
            for element in array.values() {
                let mut entry = encode_index_value(element);
                entry.extend_from_slice(&directional);
                entries.insert(entry);
            }
        }
    }
    entries
}

/// Documents lacking an indexed field have no entries, so an index can only
/// serve a target that excludes such documents itself: every indexed field
/// must carry a filter or an order-by of the target.
fn covers_target(index: &FieldIndex, filters: &[&FieldFilter], target: &Target) -> bool {
    index.segments.iter().all(|segment| {
        filters.iter().any(|filter| filter.field() == &segment.field_path)
            || target
                .order_by()
                .iter()
                .any(|order| order.field == segment.field_path)
    })
}

fn index_range(index_id: i32, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Range<EntryKey> {
    let start = (index_id, lower.unwrap_or_default(), DocumentKey::empty());
    let end = match upper {
        Some(upper) => (index_id, upper, DocumentKey::empty()),
        None => (index_id + 1, Vec::new(), DocumentKey::empty()),
    };
    start..end
}

fn prefix_range(index_id: i32, value: &FirestoreValue) -> Range<EntryKey> {
    let prefix = encode_index_value(value);
    let upper = successor_of_prefix(&prefix);
    index_range(index_id, Some(prefix), upper)
}

/// Entry ranges that cover every document matching the filters, using the
/// leading segment of `index`.
///
/// Range bounds are always widened to include the boundary value: large
/// integers share encodings, so exclusive bounds could drop matches.
fn lookup_ranges(index: &FieldIndex, filters: &[&FieldFilter]) -> Option<Vec<Range<EntryKey>>> {
    let id = index.index_id;
    if let Some(segment) = index.array_segment() {
        let filter = filters.iter().find(|f| {
            f.field() == &segment.field_path
                && matches!(f.op(), Operator::ArrayContains | Operator::ArrayContainsAny)
        })?;
        return match filter.op() {
            Operator::ArrayContains => Some(vec![prefix_range(id, filter.value())]),
            _ => Some(
                filter
                    .value()
                    .as_array()?
                    .values()
                    .iter()
                    .map(|value| prefix_range(id, value))
                    .collect(),
            ),
        };
    }

    let leading = index.directional_segments().next()?;
    filters
        .iter()
        .filter(|f| f.field() == &leading.field_path)
        .find_map(|filter| match filter.op() {
            Operator::Equal => Some(vec![prefix_range(id, filter.value())]),
            Operator::In => filter.value().as_array().map(|values| {
                values
                    .values()
                    .iter()
                    .map(|value| prefix_range(id, value))
                    .collect()
            }),
            Operator::GreaterThan | Operator::GreaterThanOrEqual => Some(vec![index_range(
                id,
                Some(encode_index_value(filter.value())),
                None,
            )]),
            Operator::LessThan | Operator::LessThanOrEqual => Some(vec![index_range(
                id,
                None,
                successor_of_prefix(&encode_index_value(filter.value())),
            )]),
            _ => None,
        })
}
