//! Offline-first document synchronization.
//!
//! The crate keeps a local cache of documents in sync with a Firestore-style
//! backend. Writes are applied locally first and queued for the backend;
//! queries are answered from the cache and kept live through a watch stream.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use firestore_sync::firestore::local::MemoryPersistence;
//! use firestore_sync::firestore::model::{DatabaseId, ResourcePath};
//! use firestore_sync::firestore::remote::{EmptyCredentialsProvider, InMemoryTransport, MultiplexedConnection};
//! use firestore_sync::{ListenEvent, ListenOptions, Query, SyncClient, SyncClientConfig, SyncSettings};
//!
//! # async fn run() -> firestore_sync::FirestoreResult<()> {
//! let (transport, _backend) = InMemoryTransport::pair();
//! let client = SyncClient::start(SyncClientConfig {
//!     database_id: DatabaseId::new("demo-project", "(default)"),
//!     persistence: Arc::new(MemoryPersistence::new()),
//!     connection: Arc::new(MultiplexedConnection::new(transport)),
//!     credentials: Arc::new(EmptyCredentialsProvider),
//!     settings: SyncSettings::default(),
//! })
//! .await?;
//!
//! let query = Query::new(ResourcePath::from_string("cities")?);
//! let registration = client.listen(query, ListenOptions::default()).await?;
//! if let Some(ListenEvent::Snapshot(snapshot)) = registration.next().await {
//!     println!("{} cities", snapshot.docs.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod firestore;
pub mod platform;
pub mod util;

pub use firestore::{
    BackoffSettings, FirestoreError, FirestoreErrorCode, FirestoreResult, ListenEvent, ListenOptions,
    ListenerRegistration, Query, SyncClient, SyncClientConfig, SyncSettings,
};
