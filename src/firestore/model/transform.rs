use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// A server-side transformation applied to a single field as part of a write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

impl TransformOperation {
    /// Result shown locally before the backend has applied the transform.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Value pinned at write time so that re-applying a non-idempotent
    /// transform on top of a newer remote document stays stable. Only
    /// increments need one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    FirestoreValue::from_array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match existing {
        Some(value) if value.is_number() => value.clone(),
        _ => FirestoreValue::from_integer(0),
    };

    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        _ => {
            let current = base.as_f64().unwrap_or(0.0);
            let delta = operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(current + delta)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    #[test]
    fn increment_starts_from_zero_for_non_numbers() {
        let op = TransformOperation::NumericIncrement(int(5));
        let result = op.apply_to_local_view(Some(&FirestoreValue::from_string("x")), Timestamp::now());
        assert_eq!(result, int(5));
    }

    #[test]
    fn increment_overflow_falls_back_to_double() {
        let op = TransformOperation::NumericIncrement(int(1));
        let result = op.apply_to_local_view(Some(&int(i64::MAX)), Timestamp::now());
        assert!(matches!(result.kind(), ValueKind::Double(_)));
    }

    #[test]
    fn array_union_skips_existing_elements() {
        let op = TransformOperation::ArrayUnion(vec![int(1), int(3)]);
        let existing = FirestoreValue::from_array(vec![int(1), int(2)]);
        let result = op.apply_to_local_view(Some(&existing), Timestamp::now());
        assert_eq!(result, FirestoreValue::from_array(vec![int(1), int(2), int(3)]));
    }

    #[test]
    fn array_remove_drops_all_matches() {
        let op = TransformOperation::ArrayRemove(vec![int(1)]);
        let existing = FirestoreValue::from_array(vec![int(1), int(2), int(1)]);
        let result = op.apply_to_local_view(Some(&existing), Timestamp::now());
        assert_eq!(result, FirestoreValue::from_array(vec![int(2)]));
    }

    #[test]
    fn base_value_only_for_increments() {
        assert!(TransformOperation::ServerTimestamp
            .compute_base_value(Some(&int(1)))
            .is_none());
        assert_eq!(
            TransformOperation::NumericIncrement(int(1)).compute_base_value(None),
            Some(int(0))
        );
    }
}
