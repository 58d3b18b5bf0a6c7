//! Everything that talks to the backend: the wire codec, the listen and
//! write streams, and the remote store that drives them.

mod bloom_filter;
pub mod credentials;
mod online_state_tracker;
mod remote_event;
mod remote_store;
mod remote_syncer;
mod serializer;
pub mod stream;
mod structured_query;
mod watch_change;
mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterApplicationStatus};
pub use credentials::{
    CredentialsProvider, CredentialsProviderArc, EmptyCredentialsProvider, Token,
    UserChangeListener,
};
pub use online_state_tracker::{OnlineState, OnlineStateHandler, MAX_WATCH_STREAM_FAILURES};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::{JsonProtoSerializer, WriteResponse};
#[cfg(feature = "websocket")]
pub use stream::WebSocketTransport;
pub use stream::{
    AcceptedStream, InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamConnection,
    StreamTransport,
};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilter, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
