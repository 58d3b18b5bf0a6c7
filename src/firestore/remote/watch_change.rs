use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message of the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means every target the stream currently watches.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<FirestoreError>,
}

/// A document entered, changed in, or left a set of targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// `None` when the document merely left the targets without the backend
    /// saying anything about its contents.
    pub new_doc: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

/// The number of documents the backend has for a target, with an optional
/// bloom filter of their names.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterProto>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BloomFilterProto {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BloomFilterJson {
    #[serde(default)]
    bits: Option<BitSequenceJson>,
    #[serde(default)]
    hash_count: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct BitSequenceJson {
    #[serde(default)]
    bitmap: Option<String>,
    #[serde(default)]
    padding: Option<i32>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(target_change);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter(filter);
    }
    Err(invalid_argument(format!("Unknown listen response: {value}")))
}

/// The global snapshot version a listen response establishes. Only target
/// changes that apply to every target carry one.
pub fn snapshot_version_from_listen_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !target_ids(change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match change.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let mut state = match value.get("targetChangeType").and_then(JsonValue::as_str) {
        None | Some("NO_CHANGE") => WatchTargetChangeState::NoChange,
        Some("ADD") => WatchTargetChangeState::Added,
        Some("REMOVE") => WatchTargetChangeState::Removed,
        Some("CURRENT") => WatchTargetChangeState::Current,
        Some("RESET") => WatchTargetChangeState::Reset,
        Some(other) => return Err(invalid_argument(format!("Unknown target change type {other}"))),
    };
    let resume_token = decode_bytes(value.get("resumeToken"))?;
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_grpc_status(cause.code),
                cause.message.unwrap_or_else(|| "target removed by the backend".to_string()),
            )
        });
    if cause.is_some() {
        state = WatchTargetChangeState::Removed;
    }

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: target_ids(value.get("targetIds")),
        resume_token,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: target_ids(value.get("targetIds")),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_doc: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let version = match value.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time)?,
        None => SnapshotVersion::min(),
    };
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        new_doc: Some(MutableDocument::new_no_document(key.clone(), version)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: target_ids(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let parsed: BloomFilterJson = serde_json::from_value(names.clone())
                .map_err(|err| invalid_argument(format!("Malformed unchangedNames: {err}")))?;
            let bits = parsed.bits.unwrap_or_default();
            let bitmap = match bits.bitmap {
                Some(encoded) => BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|err| invalid_argument(format!("Malformed bloom filter bitmap: {err}")))?,
                None => Vec::new(),
            };
            Some(BloomFilterProto {
                bitmap,
                padding: bits.padding.unwrap_or(0),
                hash_count: parsed.hash_count.unwrap_or(0),
            })
        }
        None => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Malformed resume token: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        match decode_watch_change(&serializer(), &change).unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, WatchTargetChangeState::Current);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn cause_turns_change_into_removal() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, WatchTargetChangeState::Removed);
                let cause = change.cause.unwrap();
                assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
                assert_eq!(cause.message(), "denied");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn document_delete_becomes_no_document() {
        let change = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/c/1",
                "readTime": "2024-01-01T00:00:01Z",
                "removedTargetIds": [2]
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap() {
            WatchChange::Document(change) => {
                assert_eq!(change.removed_target_ids, vec![2]);
                let doc = change.new_doc.unwrap();
                assert!(doc.is_no_document());
                assert_eq!(doc.key().to_string(), "c/1");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn filter_carries_bloom_filter() {
        let change = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0xffu8]), "padding": 1 },
                    "hashCount": 2
                }
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap() {
            WatchChange::ExistenceFilter(change) => {
                assert_eq!(change.target_id, 2);
                assert_eq!(change.existence_filter.count, 3);
                let bloom = change.existence_filter.unchanged_names.unwrap();
                assert_eq!(bloom.bitmap, vec![0xff]);
                assert_eq!(bloom.padding, 1);
                assert_eq!(bloom.hash_count, 2);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } });
        let scoped = json!({
            "targetChange": { "targetIds": [2], "readTime": "2024-01-01T00:00:01Z" }
        });
        assert!(!snapshot_version_from_listen_response(&serializer, &global)
            .unwrap()
            .is_min());
        assert!(snapshot_version_from_listen_response(&serializer, &scoped)
            .unwrap()
            .is_min());
    }
}
