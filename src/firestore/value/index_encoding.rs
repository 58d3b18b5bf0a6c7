//! Order-preserving byte encoding of values.
//!
//! For any two values `a` and `b`, comparing `encode(a)` and `encode(b)`
//! bytewise gives the same result as [`compare_values`](super::compare_values)
//! (numbers are encoded as doubles, so integers beyond 2^53 may collide).
//! Every encoded value is prefix-free, so encodings can be concatenated to
//! build composite index keys.

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

const TYPE_NULL: u8 = 5;
const TYPE_BOOLEAN: u8 = 10;
const TYPE_NAN: u8 = 13;
const TYPE_NUMBER: u8 = 15;
const TYPE_TIMESTAMP: u8 = 20;
const TYPE_SERVER_TIMESTAMP: u8 = 25;
const TYPE_STRING: u8 = 30;
const TYPE_BYTES: u8 = 35;
const TYPE_REFERENCE: u8 = 40;
const TYPE_GEO_POINT: u8 = 45;
const TYPE_ARRAY: u8 = 50;
const TYPE_MAP: u8 = 55;

const ESCAPE: u8 = 0x00;
const ESCAPED_NULL: u8 = 0xff;
const ESCAPED_FF: u8 = 0x00;
const SEPARATOR: u8 = 0x01;
const END_OF_CONTAINER: u8 = 0x01;
const ENTRY_MARKER: u8 = 0x02;

#[derive(Debug, Default)]
pub struct IndexValueWriter {
    buffer: Vec<u8>,
}

impl IndexValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_value(&mut self, value: &FirestoreValue) {
        match value.kind() {
            ValueKind::Null => self.buffer.push(TYPE_NULL),
            ValueKind::Boolean(value) => {
                self.buffer.push(TYPE_BOOLEAN);
                self.buffer.push(u8::from(*value));
            }
            ValueKind::Integer(value) => self.write_number(*value as f64),
            ValueKind::Double(value) => self.write_number(*value),
            ValueKind::Timestamp(value) => {
                self.buffer.push(TYPE_TIMESTAMP);
                self.write_timestamp(value);
            }
            ValueKind::ServerTimestamp {
                local_write_time, ..
            } => {
                self.buffer.push(TYPE_SERVER_TIMESTAMP);
                self.write_timestamp(local_write_time);
            }
            ValueKind::String(value) => {
                self.buffer.push(TYPE_STRING);
                self.write_escaped(value.as_bytes());
            }
            ValueKind::Bytes(value) => {
                self.buffer.push(TYPE_BYTES);
                self.write_escaped(value.as_slice());
            }
            ValueKind::Reference(key) => {
                self.buffer.push(TYPE_REFERENCE);
                for segment in key.path().iter() {
                    self.buffer.push(ENTRY_MARKER);
                    self.write_escaped(segment.as_bytes());
                }
                self.buffer.push(END_OF_CONTAINER);
            }
            ValueKind::GeoPoint(point) => {
                self.buffer.push(TYPE_GEO_POINT);
                self.write_f64(point.latitude());
                self.write_f64(point.longitude());
            }
            ValueKind::Array(array) => {
                self.buffer.push(TYPE_ARRAY);
                for element in array.values() {
                    self.write_value(element);
                }
                self.buffer.push(END_OF_CONTAINER);
            }
            ValueKind::Map(map) => {
                self.buffer.push(TYPE_MAP);
                for (key, element) in map.fields() {
                    self.buffer.push(ENTRY_MARKER);
                    self.write_escaped(key.as_bytes());
                    self.write_value(element);
                }
                self.buffer.push(END_OF_CONTAINER);
            }
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    fn write_number(&mut self, value: f64) {
        if value.is_nan() {
            self.buffer.push(TYPE_NAN);
            return;
        }
        self.buffer.push(TYPE_NUMBER);
        // -0.0 and 0.0 compare equal.
        self.write_f64(if value == 0.0 { 0.0 } else { value });
    }

    fn write_f64(&mut self, value: f64) {
        let bits = value.to_bits();
        let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
        self.buffer.extend_from_slice(&ordered.to_be_bytes());
    }

    fn write_timestamp(&mut self, value: &Timestamp) {
        let seconds = (value.seconds as u64) ^ (1 << 63);
        self.buffer.extend_from_slice(&seconds.to_be_bytes());
        self.buffer.extend_from_slice(&(value.nanos as u32).to_be_bytes());
    }

    fn write_escaped(&mut self, bytes: &[u8]) {
        for byte in bytes {
            match *byte {
                0x00 => self.buffer.extend_from_slice(&[ESCAPE, ESCAPED_NULL]),
                0xff => self.buffer.extend_from_slice(&[0xff, ESCAPED_FF]),
                other => self.buffer.push(other),
            }
        }
        self.buffer.extend_from_slice(&[ESCAPE, SEPARATOR]);
    }
}

/// Encodes a single value.
pub fn encode_index_value(value: &FirestoreValue) -> Vec<u8> {
    let mut writer = IndexValueWriter::new();
    writer.write_value(value);
    writer.finish()
}

/// Smallest byte string greater than every string that has `prefix` as a
/// prefix, or `None` if no such string exists.
pub fn successor_of_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut result = prefix.to_vec();
    while let Some(last) = result.pop() {
        if last < 0xff {
            result.push(last + 1);
            return Some(result);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DocumentKey;
    use crate::firestore::value::compare_values;
    use std::collections::BTreeMap;

    fn sample_values() -> Vec<FirestoreValue> {
        let mut map_a = BTreeMap::new();
        map_a.insert("a".to_string(), FirestoreValue::from_integer(1));
        let mut map_empty_key = BTreeMap::new();
        map_empty_key.insert(String::new(), FirestoreValue::null());
        let mut map_b = BTreeMap::new();
        map_b.insert("a".to_string(), FirestoreValue::from_integer(1));
        map_b.insert("b".to_string(), FirestoreValue::from_integer(0));
        vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NEG_INFINITY),
            FirestoreValue::from_integer(-100),
            FirestoreValue::from_double(-0.5),
            FirestoreValue::from_integer(0),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(21),
            FirestoreValue::from_integer(25),
            FirestoreValue::from_timestamp(Timestamp::new(-5, 0)),
            FirestoreValue::from_timestamp(Timestamp::new(5, 10)),
            FirestoreValue::from_string(""),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("a\u{0}"),
            FirestoreValue::from_string("ab"),
            FirestoreValue::from_reference(DocumentKey::from_string("c/a").unwrap()),
            FirestoreValue::from_reference(DocumentKey::from_string("c/a/d/b").unwrap()),
            FirestoreValue::from_reference(DocumentKey::from_string("c/b").unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
            ]),
            FirestoreValue::from_map(BTreeMap::new()),
            FirestoreValue::from_map(map_empty_key),
            FirestoreValue::from_map(map_a),
            FirestoreValue::from_map(map_b),
        ]
    }

    #[test]
    fn encoding_preserves_value_order() {
        let values = sample_values();
        for left in &values {
            for right in &values {
                let expected = compare_values(left, right);
                let actual = encode_index_value(left).cmp(&encode_index_value(right));
                assert_eq!(actual, expected, "{left:?} vs {right:?}");
            }
        }
    }

    #[test]
    fn successor_skips_trailing_ff() {
        assert_eq!(successor_of_prefix(&[1, 0xff]), Some(vec![2]));
        assert_eq!(successor_of_prefix(&[0xff]), None);
    }
}
