//! Queries, views and the sync engine that keeps them up to date.

mod client;
mod event_manager;
pub mod query;
mod sync_engine;
pub mod target;
mod user;
mod view;
mod view_snapshot;

pub use client::{SyncClient, SyncClientConfig};
pub use event_manager::{
    EventManager, ListenEvent, ListenOptions, ListenerRegistration, SnapshotsInSyncRegistration,
};
pub use query::{
    Bound, CompositeOperator, Direction, FieldFilter, Filter, LimitType, Operator, OrderBy, Query,
};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteAcknowledgement};
pub use target::{Target, TargetData, TargetIdGenerator, TargetPurpose};
pub use user::User;
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, ViewSnapshot};
