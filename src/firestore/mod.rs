pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

pub use self::core::{ListenEvent, ListenOptions, ListenerRegistration, Query, SyncClient, SyncClientConfig};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{BackoffSettings, SyncSettings};
