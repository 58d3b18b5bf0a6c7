use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Total order across all values: first by [`TypeOrder`](super::TypeOrder),
/// then within the type. Integers and doubles compare numerically and NaN
/// sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = left.type_order();
    let right_type = right.type_order();
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l.cmp(r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields().iter()) {
        match lk.cmp(rk) {
            Ordering::Equal => {}
            other => return other,
        }
        match compare_values(lv, rv) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

/// Value equality. Stricter than `compare_values(..) == Equal`: an integer
/// never equals a double, `-0.0` differs from `0.0`, and NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(lv, rv)| values_equal(lv, rv))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, lv)| {
                    r.fields()
                        .get(key)
                        .map(|rv| values_equal(lv, rv))
                        .unwrap_or(false)
                })
        }
        _ => false,
    }
}

/// Stable textual form used to build canonical query ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical_id(value, &mut out);
    out
}

fn write_canonical_id(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
        ValueKind::Integer(value) => out.push_str(&value.to_string()),
        ValueKind::Double(value) => out.push_str(&format!("{value:?}")),
        ValueKind::Timestamp(value) => {
            out.push_str(&format!("time({},{})", value.seconds, value.nanos))
        }
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => out.push_str(&format!(
            "serverTime({},{})",
            local_write_time.seconds, local_write_time.nanos
        )),
        ValueKind::String(value) => out.push_str(value),
        ValueKind::Bytes(value) => out.push_str(&value.to_base64()),
        ValueKind::Reference(key) => out.push_str(&key.path().canonical_string()),
        ValueKind::GeoPoint(point) => {
            out.push_str(&format!("geo({},{})", point.latitude(), point.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_id(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical_id(element, out);
            }
            out.push('}');
        }
    }
}
