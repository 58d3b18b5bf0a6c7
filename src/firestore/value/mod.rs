mod array_value;
mod bytes_value;
mod compare;
mod index_encoding;
mod map_value;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use compare::{canonical_id, compare_values, values_equal};
pub use index_encoding::{encode_index_value, successor_of_prefix, IndexValueWriter};
pub use map_value::{FieldMask, MapValue};
pub use value::{FirestoreValue, TypeOrder, ValueKind};
