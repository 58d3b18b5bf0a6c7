use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, CompositeOperator, Direction, FieldFilter, Filter, Operator, Target};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::ValueKind;

/// Encodes a query target as `{parent, structuredQuery}`.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let mut structured = serde_json::Map::new();

    let (parent, from_entry) = match target.collection_group() {
        Some(group) => (
            serializer.resource_name(target.path()),
            json!({ "collectionId": group, "allDescendants": true }),
        ),
        None => (
            serializer.resource_name(&target.path().without_last()),
            json!({ "collectionId": target.path().last_segment().unwrap_or_default() }),
        ),
    };
    structured.insert("from".to_string(), JsonValue::Array(vec![from_entry]));

    if let Some(filter) = encode_filters(serializer, target.filters()) {
        structured.insert("where".to_string(), filter);
    }

    if !target.order_by().is_empty() {
        let orders: Vec<_> = target
            .order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": direction_name(order.direction),
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }
    if let Some(start) = target.start_at() {
        structured.insert("startAt".to_string(), encode_cursor(serializer, start, true));
    }
    if let Some(end) = target.end_at() {
        structured.insert("endAt".to_string(), encode_cursor(serializer, end, false));
    }

    json!({
        "parent": parent,
        "structuredQuery": JsonValue::Object(structured),
    })
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[Filter]) -> Option<JsonValue> {
    match filters {
        [] => None,
        [single] => Some(encode_filter(serializer, single)),
        many => Some(json!({
            "compositeFilter": {
                "op": "AND",
                "filters": many
                    .iter()
                    .map(|filter| encode_filter(serializer, filter))
                    .collect::<Vec<_>>()
            }
        })),
    }
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field) => encode_field_filter(serializer, field),
        Filter::Composite { op, filters } => {
            let op = match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            };
            json!({
                "compositeFilter": {
                    "op": op,
                    "filters": filters
                        .iter()
                        .map(|filter| encode_filter(serializer, filter))
                        .collect::<Vec<_>>()
                }
            })
        }
    }
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    // Equality against null or NaN travels as a unary filter.
    let unary = match (filter.op(), filter.value().kind()) {
        (Operator::Equal, ValueKind::Null) => Some("IS_NULL"),
        (Operator::NotEqual, ValueKind::Null) => Some("IS_NOT_NULL"),
        (Operator::Equal, ValueKind::Double(value)) if value.is_nan() => Some("IS_NAN"),
        (Operator::NotEqual, ValueKind::Double(value)) if value.is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    if let Some(op) = unary {
        return json!({ "unaryFilter": { "field": field, "op": op } });
    }
    json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op()),
            "value": serializer.encode_value(filter.value()),
        }
    })
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
    }
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    }
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .position
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}
