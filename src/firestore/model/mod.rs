mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod transform;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexSegment};
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{calculate_overlay_mutation, Mutation, MutationKind, MutationResult, Precondition};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use transform::{FieldTransform, TransformOperation};

/// Locally assigned, monotonically increasing id of a mutation batch.
pub type BatchId = i32;

/// Locally assigned id of a watch target.
pub type TargetId = i32;

/// Sequence number recording the last time a target was used.
pub type ListenSequenceNumber = i64;

/// Sequence number of targets that are never persisted, such as limbo
/// resolutions.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
