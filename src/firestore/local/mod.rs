//! Durable client-side state: the remote document cache, the mutation
//! queue, overlays, target metadata and field indexes.

mod document_overlay_cache;
mod index_manager;
mod local_documents;
mod local_store;
mod mutation_queue;
pub mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;

pub use document_overlay_cache::DocumentOverlayCache;
pub use index_manager::IndexManager;
pub use local_documents::LocalDocumentsView;
pub use local_store::{
    DocumentMap, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
pub use mutation_queue::MutationQueue;
#[doc(inline)]
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{QueryContext, RemoteDocumentCache};
pub use target_cache::TargetCache;
