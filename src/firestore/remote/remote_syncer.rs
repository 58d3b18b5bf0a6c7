use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::core::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks through which the remote store hands backend results to the
/// sync engine.
///
/// The remote store invokes these from operations running on the async
/// queue and never while holding its own state lock, so implementations may
/// call back into the remote store.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot assembled from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to serve a watch target.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The oldest pending batch was committed.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The oldest pending batch was permanently rejected.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the client currently believes match `target_id` on the backend.
    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> RemoteStoreFuture<'_, BTreeSet<DocumentKey>>;

    fn apply_online_state_change(
        &self,
        online_state: OnlineState,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Switches local state to `user`. Runs while both streams are stopped.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
