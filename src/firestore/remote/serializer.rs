use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{TargetData, TargetPurpose};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, MutableDocument, Mutation, MutationKind,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_query_target;
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Translates between the model and the JSON form of the wire protocol.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

/// The backend's answer to one write request.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    pub(crate) fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let path = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!(
                "Resource name {name} does not belong to database {}",
                self.database_name()
            ))
        })?;
        DocumentKey::from_string(path)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) if double.is_nan() => json!({ "doubleValue": "NaN" }),
            ValueKind::Double(double) if double.is_infinite() => {
                let text = if *double > 0.0 { "Infinity" } else { "-Infinity" };
                json!({ "doubleValue": text })
            }
            ValueKind::Double(double) => json!({ "doubleValue": double }),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": encode_timestamp(timestamp) })
            }
            ValueKind::ServerTimestamp { .. } => {
                // Pending server timestamps only exist in the local view.
                log::debug!("encoding a local server timestamp placeholder as null");
                json!({ "nullValue": JsonValue::Null })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(key) => json!({ "referenceValue": self.document_name(key) }),
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values = array
                    .values()
                    .iter()
                    .map(|value| self.encode_value(value))
                    .collect::<Vec<_>>();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({
                "mapValue": {
                    "fields": self.encode_map_fields(map)
                }
            }),
        }
    }

    pub fn encode_map_fields(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (key, value) in map.fields() {
            fields.insert(key.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => match value.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            let text = timestamp_value
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
            return Ok(FirestoreValue::from_timestamp(self.decode_timestamp_string(text)?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let text = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(text));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let text = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let bytes = BytesValue::from_base64(text)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(bytes));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            return Ok(FirestoreValue::from_reference(self.document_key_from_name(name)?));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point
                .get("latitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            let longitude = geo_point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let values = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(values));
        }
        if let Some(map_value) = object.get("mapValue") {
            let map = self.decode_map_value(map_value)?;
            return Ok(FirestoreValue::from_map(map.into_fields()));
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }

    /// Decodes an object with an optional `fields` member.
    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected object for map value"))?;
        let fields_object = match object.get("fields") {
            Some(fields) => fields
                .as_object()
                .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
            None => return Ok(MapValue::empty()),
        };
        let mut fields = BTreeMap::new();
        for (key, value) in fields_object {
            fields.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(fields))
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        let datetime = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp {value}: {err}")))?
            .with_timezone(&Utc);
        Ok(Timestamp::new(
            datetime.timestamp(),
            datetime.timestamp_subsec_nanos() as i32,
        ))
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        match value.as_str() {
            Some(text) => Ok(SnapshotVersion::new(self.decode_timestamp_string(text)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    /// Decodes a found document as sent in `documentChange` messages.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let data = self.decode_map_value(document)?;
        let version = document
            .get("updateTime")
            .map(|value| self.decode_version(value))
            .transpose()?
            .unwrap_or_else(SnapshotVersion::min);
        if version.is_min() {
            return Err(invalid_argument(format!("Document {name} has no update time")));
        }
        let create_time = document
            .get("createTime")
            .map(|value| self.decode_version(value))
            .transpose()?
            .unwrap_or_else(SnapshotVersion::min);
        Ok(MutableDocument::new_found_document(key, version, create_time, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".to_string(), self.encode_document(mutation.key(), value));
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".to_string(), self.encode_document(mutation.key(), data));
                let paths: Vec<String> = mask.paths().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(self.document_name(mutation.key())));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(self.document_name(mutation.key())));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn encode_document(&self, key: &DocumentKey, data: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_map_fields(data),
        })
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(*version) }))
            }
        }
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path().canonical_string();
        let encode_all = |values: &[FirestoreValue]| {
            values
                .iter()
                .map(|value| self.encode_value(value))
                .collect::<Vec<_>>()
        };
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": encode_all(elements) }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": encode_all(elements) }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    /// The `addTargets` entry for one watch target.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        let target = &target_data.target;
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            encoded.insert("query".to_string(), encode_query_target(self, target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
        }
        if let Some(expected_count) = target_data.expected_count {
            encoded.insert("expectedCount".to_string(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    /// Labels attached to a listen request, so the backend can attribute
    /// re-listens caused by existence filter mismatches.
    pub fn encode_listen_labels(&self, purpose: TargetPurpose) -> Option<JsonValue> {
        let label = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(json!({ "goog-listen-tags": label }))
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        let writes = mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect::<Vec<_>>();
        json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        })
    }

    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(token) => BASE64_STANDARD
                .decode(token)
                .map_err(|err| invalid_argument(format!("Invalid stream token: {err}")))?,
            None => Vec::new(),
        };
        let commit_version = value
            .get("commitTime")
            .map(|time| self.decode_version(time))
            .transpose()?
            .unwrap_or_else(SnapshotVersion::min);
        let mutation_results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.decode_mutation_result(result, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    fn decode_mutation_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        // Deletes and verifies carry no update time; they take the commit
        // version instead.
        let version = match value.get("updateTime") {
            Some(update_time) => self.decode_version(update_time)?,
            None => commit_version,
        };
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| self.decode_value(result))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult::new(version, transform_results))
    }
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
    {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00Z".to_string(),
    }
}
