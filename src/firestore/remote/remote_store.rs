//! The remote store owns the listen and write streams.
//!
//! Every public method and every stream event runs as an operation on the
//! async queue. The store keeps its mutable state behind one lock and calls
//! into the [`RemoteSyncer`] only after releasing it, so the syncer is free
//! to call back into the store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::{Mutex, MutexGuard};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::{TargetData, User};
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::LocalStore;
use crate::firestore::model::{
    DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::credentials::CredentialsProviderArc;
use crate::firestore::remote::online_state_tracker::{
    OnlineState, OnlineStateHandler, OnlineStateTracker,
};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{
    PersistentStream, StreamConnection, StreamEvent, StreamEventSink, StreamKind, WatchStream,
    WriteStream,
};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::settings::SyncSettings;
use crate::util::async_queue::AsyncQueue;

/// Reasons the network is currently not used. The streams run only while
/// the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets the sync engine listens to, with their latest resume tokens.
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    /// Present while the listen stream is started.
    aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) and not yet acknowledged, oldest
    /// first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    watch_flush_scheduled: bool,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && !self.watch_stream.stream().is_started()
            && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network()
            && !self.write_stream.stream().is_started()
            && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self, max_pending_writes: usize) -> bool {
        self.can_use_network() && self.write_pipeline.len() < max_pending_writes
    }

    /// Stops both streams and forgets everything tied to them.
    fn disable_network_internal(&mut self) {
        self.write_stream.stream_mut().stop();
        self.write_stream.reset();
        self.watch_stream.stream_mut().stop();
        self.watch_stream.clear_pending();
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.aggregator = None;
    }
}

struct RemoteStoreInner {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    serializer: Arc<JsonProtoSerializer>,
    syncer: Weak<dyn RemoteSyncer>,
    max_pending_writes: usize,
    state: Mutex<RemoteStoreState>,
}

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

/// Target metadata as the remote store knows it, for the aggregator.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

#[async_trait]
impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id).await
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

struct RemoteStoreSink(Weak<RemoteStoreInner>);

impl StreamEventSink for RemoteStoreSink {
    fn dispatch(
        &self,
        kind: StreamKind,
        generation: u64,
        event: StreamEvent,
    ) -> BoxFuture<'static, FirestoreResult<()>> {
        let inner = self.0.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            let store = RemoteStore { inner };
            match kind {
                StreamKind::Listen => store.handle_listen_event(generation, event).await,
                StreamKind::Write => store.handle_write_event(generation, event).await,
            }
        }
        .boxed()
    }
}

fn online_state_handler(queue: AsyncQueue, syncer: Weak<dyn RemoteSyncer>) -> OnlineStateHandler {
    Arc::new(move |online_state| {
        let syncer = syncer.clone();
        queue.enqueue_and_forget(move || async move {
            match syncer.upgrade() {
                Some(syncer) => syncer.apply_online_state_change(online_state).await,
                None => Ok(()),
            }
        });
    })
}

impl RemoteStore {
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        serializer: Arc<JsonProtoSerializer>,
        connection: Arc<dyn StreamConnection>,
        credentials: CredentialsProviderArc,
        syncer: Weak<dyn RemoteSyncer>,
        settings: &SyncSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let sink: Arc<dyn StreamEventSink> = Arc::new(RemoteStoreSink(weak.clone()));
            let listen = PersistentStream::new(
                StreamKind::Listen,
                queue.clone(),
                Arc::clone(&connection),
                Arc::clone(&credentials),
                Arc::clone(&sink),
                settings.backoff.clone(),
                settings.listen_idle_timeout,
            );
            let write = PersistentStream::new(
                StreamKind::Write,
                queue.clone(),
                connection,
                credentials,
                sink,
                settings.backoff.clone(),
                settings.write_idle_timeout,
            );
            let tracker = OnlineStateTracker::new(
                settings.online_state_timeout,
                online_state_handler(queue.clone(), syncer.clone()),
            );
            RemoteStoreInner {
                queue: queue.clone(),
                local_store,
                serializer: Arc::clone(&serializer),
                syncer,
                max_pending_writes: settings.max_pending_writes,
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_stream: WatchStream::new(listen, Arc::clone(&serializer)),
                    write_stream: WriteStream::new(write, Arc::clone(&serializer)),
                    aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                    online_state_tracker: tracker,
                    watch_flush_scheduled: false,
                }),
            }
        });
        Self { inner }
    }

    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.inner.syncer.upgrade()
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state_tracker.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(&mut state).await
    }

    async fn enable_network_internal(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        if !state.can_use_network() {
            return Ok(());
        }
        if !state.write_stream.stream().is_started() {
            let token = self.inner.local_store.last_stream_token().await?;
            state.write_stream.set_last_stream_token(token);
        }
        if state.should_start_watch_stream() {
            self.start_watch_stream(state);
        } else {
            state.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline_locked(state).await
    }

    /// Stops both streams until [`RemoteStore::enable_network`]. Pending
    /// writes stay queued locally and are resent later.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.offline_causes.insert(OfflineCause::UserDisabled);
        state.disable_network_internal();
        // Without a network the client is offline, not merely unsure.
        state.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        let mut state = self.inner.state.lock().await;
        state.offline_causes.insert(OfflineCause::Shutdown);
        state.disable_network_internal();
        state.online_state_tracker.set(OnlineState::Unknown);
        Ok(())
    }

    /// Starts watching a target. Targets already watched are ignored.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        let mut state = self.inner.state.lock().await;
        if state.listen_targets.contains_key(&target_id) {
            return Ok(());
        }
        state.listen_targets.insert(target_id, target_data.clone());

        if state.should_start_watch_stream() {
            self.start_watch_stream(&mut state);
        } else if state.watch_stream.stream().is_open() {
            self.send_watch_request(&mut state, target_data).await;
            self.schedule_watch_flush(&mut state);
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        let was_watched = state.listen_targets.remove(&target_id).is_some();
        if !was_watched {
            // Targets the backend removed on its own need no unwatch.
            log::debug!("unlisten of target {target_id} that is not watched");
        }
        if was_watched && state.watch_stream.stream().is_open() {
            self.send_unwatch_request(&mut state, target_id);
            self.schedule_watch_flush(&mut state);
        }
        if state.listen_targets.is_empty() {
            if state.watch_stream.stream().is_open() {
                state.watch_stream.stream_mut().mark_idle();
            } else if state.can_use_network() {
                // Nothing to watch means nothing to be offline about.
                state.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Switches to `user`: both streams stop, the syncer moves local state
    /// over, and the streams restart with the new credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        log::debug!("remote store received new credentials for {user}");
        {
            let mut state = self.inner.state.lock().await;
            let used_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            state.disable_network_internal();
            if used_network {
                state.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        let result = syncer.handle_credential_change(user).await;
        let mut state = self.inner.state.lock().await;
        state.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(&mut state).await?;
        result
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.aggregator = Some(WatchChangeAggregator::new(
            &self.inner.serializer.database_name(),
        ));
        state.watch_stream.stream_mut().start();
        let weak = Arc::downgrade(&self.inner);
        state
            .online_state_tracker
            .handle_watch_stream_start(&self.inner.queue, move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .state
                        .lock()
                        .await
                        .online_state_tracker
                        .handle_online_state_timeout();
                }
                Ok(())
            });
    }

    async fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = state.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let mut target_data = target_data;
        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        if resuming {
            if let Some(syncer) = self.syncer() {
                let expected = syncer.get_remote_keys_for_target(target_id).await.len();
                target_data = target_data.with_expected_count(expected as i32);
            }
        }
        state.watch_stream.watch(target_data);
    }

    fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) {
        if let Some(aggregator) = state.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        state.watch_stream.unwatch(target_id);
    }

    /// Sends recorded watch requests from a later queue operation, so that
    /// requests made by consecutive operations share one message.
    fn schedule_watch_flush(&self, state: &mut RemoteStoreState) {
        if state.watch_flush_scheduled {
            return;
        }
        state.watch_flush_scheduled = true;
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.enqueue_and_forget(move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let mut state = inner.state.lock().await;
            state.watch_flush_scheduled = false;
            state.watch_stream.flush().await
        });
    }

    async fn handle_listen_event(&self, generation: u64, event: StreamEvent) -> FirestoreResult<()> {
        match event {
            StreamEvent::Opened(handle) => {
                let mut state = self.inner.state.lock().await;
                if state.watch_stream.stream_mut().handle_opened(generation, handle) {
                    self.on_watch_stream_open(&mut state).await?;
                }
                Ok(())
            }
            StreamEvent::Message(payload) => {
                let decoded = {
                    let mut state = self.inner.state.lock().await;
                    if !state.watch_stream.stream_mut().handle_message(generation) {
                        return Ok(());
                    }
                    state.watch_stream.decode(&payload)
                };
                match decoded {
                    Ok((change, snapshot_version)) => {
                        self.on_watch_stream_change(change, snapshot_version).await
                    }
                    Err(err) => {
                        log::warn!("closing listen stream after undecodable message: {err}");
                        let mut state = self.inner.state.lock().await;
                        if state
                            .watch_stream
                            .stream_mut()
                            .handle_closed(generation, Some(err.clone()))
                        {
                            self.on_watch_stream_close(&mut state, Some(err));
                        }
                        Ok(())
                    }
                }
            }
            StreamEvent::Closed(error) => {
                let mut state = self.inner.state.lock().await;
                if state
                    .watch_stream
                    .stream_mut()
                    .handle_closed(generation, error.clone())
                {
                    self.on_watch_stream_close(&mut state, error);
                }
                Ok(())
            }
            StreamEvent::BackoffElapsed => {
                let mut state = self.inner.state.lock().await;
                state.watch_stream.stream_mut().handle_backoff_elapsed(generation);
                Ok(())
            }
            StreamEvent::IdleTimeout => {
                let mut state = self.inner.state.lock().await;
                if state.watch_stream.stream_mut().handle_idle_timeout(generation) {
                    self.on_watch_stream_close(&mut state, None);
                }
                Ok(())
            }
        }
    }

    async fn on_watch_stream_open(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(state, target_data).await;
        }
        state.watch_stream.flush().await
    }

    fn on_watch_stream_close(&self, state: &mut RemoteStoreState, error: Option<FirestoreError>) {
        state.aggregator = None;
        state.watch_stream.clear_pending();
        if state.should_start_watch_stream() {
            let error = error.unwrap_or_else(|| unavailable("The listen stream closed"));
            state.online_state_tracker.handle_watch_stream_failure(&error);
            self.start_watch_stream(state);
        } else {
            state.online_state_tracker.set(OnlineState::Unknown);
        }
    }

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        let mut state = self.inner.state.lock().await;
        // Any message proves the backend reachable.
        state.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if let (WatchTargetChangeState::Removed, Some(cause)) =
                (target_change.state, &target_change.cause)
            {
                let mut rejected = Vec::new();
                for target_id in &target_change.target_ids {
                    if state.listen_targets.remove(target_id).is_some() {
                        if let Some(aggregator) = state.aggregator.as_mut() {
                            aggregator.remove_target(*target_id);
                        }
                        rejected.push(*target_id);
                    }
                }
                drop(state);
                for target_id in rejected {
                    log::debug!("target {target_id} rejected by the backend: {cause}");
                    syncer.reject_listen(target_id, cause.clone()).await?;
                }
                return Ok(());
            }
        }

        let event = {
            let RemoteStoreState {
                aggregator,
                listen_targets,
                ..
            } = &mut *state;
            let Some(aggregator) = aggregator.as_mut() else {
                log::debug!("dropping watch change for a stopped listen stream");
                return Ok(());
            };
            let provider = ListenTargetMetadata {
                listen_targets: &*listen_targets,
                syncer: &*syncer,
            };
            match change {
                WatchChange::Document(change) => {
                    aggregator.handle_document_change(&provider, change).await
                }
                WatchChange::ExistenceFilter(change) => {
                    aggregator.handle_existence_filter(&provider, change).await
                }
                WatchChange::TargetChange(change) => {
                    aggregator.handle_target_change(&provider, &change).await
                }
            }

            if snapshot_version.is_min() {
                return Ok(());
            }
            let last_remote_version = self.inner.local_store.last_remote_snapshot_version().await?;
            if snapshot_version < last_remote_version {
                return Ok(());
            }
            aggregator
                .create_remote_event(&provider, snapshot_version)
                .await
        };

        self.update_listen_targets(&mut state, &event).await;
        drop(state);
        self.apply_remote_event(syncer, event).await
    }

    /// Records the resume tokens of a raised snapshot and re-listens targets
    /// whose existence filter did not match.
    async fn update_listen_targets(&self, state: &mut RemoteStoreState, event: &RemoteEvent) {
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(data) = state.listen_targets.get_mut(target_id) {
                let updated = data
                    .clone()
                    .with_resume_token(change.resume_token.clone(), event.snapshot_version);
                *data = updated;
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(data) = state.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // The resume token describes a state known to be wrong.
            let snapshot_version = data.snapshot_version;
            state.listen_targets.insert(
                *target_id,
                data.clone().with_resume_token(Vec::new(), snapshot_version),
            );
            // Unwatch and rewatch without a resume token to get a full
            // result set.
            self.send_unwatch_request(state, *target_id);
            let request =
                TargetData::new(data.target.clone(), *target_id, *purpose, data.sequence_number);
            self.send_watch_request(state, request).await;
        }
        if !event.target_mismatches.is_empty() {
            self.schedule_watch_flush(state);
        }
    }

    async fn apply_remote_event(
        &self,
        syncer: Arc<dyn RemoteSyncer>,
        event: RemoteEvent,
    ) -> FirestoreResult<()> {
        match syncer.apply_remote_event(event).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!("ignoring watch snapshot after losing the primary lease: {err}");
                Ok(())
            }
            Err(err) if err.is_transient_storage() => {
                log::warn!("failed to apply watch snapshot, restarting listen stream: {err}");
                self.restart_listen_from_scratch().await
            }
            Err(err) => Err(err),
        }
    }

    /// Drops all resume tokens and reconnects, so the backend resends every
    /// target's complete result set.
    async fn restart_listen_from_scratch(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        for data in state.listen_targets.values_mut() {
            let reset = data
                .clone()
                .with_resume_token(Vec::new(), SnapshotVersion::min());
            *data = reset;
        }
        state.disable_network_internal();
        state.online_state_tracker.set(OnlineState::Unknown);
        self.enable_network_internal(&mut state).await
    }

    /// Moves pending batches from the local store into the write pipeline,
    /// up to the configured limit, and starts the write stream if needed.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        self.fill_write_pipeline_locked(&mut state).await
    }

    async fn fill_write_pipeline_locked(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        let mut last_batch_id = state
            .write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id);
        while state.can_add_to_write_pipeline(self.inner.max_pending_writes) {
            match self.inner.local_store.next_mutation_batch(last_batch_id).await? {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    if state.write_stream.stream().is_open() && state.write_stream.handshake_complete() {
                        state.write_stream.write_mutations(&batch.mutations).await?;
                    }
                    state.write_pipeline.push_back(batch);
                }
                None => {
                    if state.write_pipeline.is_empty() {
                        state.write_stream.stream_mut().mark_idle();
                    }
                    break;
                }
            }
        }
        if state.should_start_write_stream() {
            state.write_stream.stream_mut().start();
        }
        Ok(())
    }

    async fn handle_write_event(&self, generation: u64, event: StreamEvent) -> FirestoreResult<()> {
        match event {
            StreamEvent::Opened(handle) => {
                let mut state = self.inner.state.lock().await;
                if state.write_stream.stream_mut().handle_opened(generation, handle) {
                    state.write_stream.write_handshake().await?;
                }
                Ok(())
            }
            StreamEvent::Message(payload) => {
                let mut state = self.inner.state.lock().await;
                if !state.write_stream.stream_mut().handle_message(generation) {
                    return Ok(());
                }
                match state.write_stream.handle_response(&payload) {
                    Ok(None) => self.on_write_handshake_complete(&mut state).await,
                    Ok(Some(response)) => {
                        let Some(batch) = state.write_pipeline.pop_front() else {
                            return Err(internal_error("Write response without a pending batch"));
                        };
                        let stream_token = state.write_stream.last_stream_token().to_vec();
                        drop(state);
                        let result = MutationBatchResult::from(
                            batch,
                            response.commit_version,
                            response.mutation_results,
                            stream_token,
                        )?;
                        if let Some(syncer) = self.syncer() {
                            syncer.apply_successful_write(result).await?;
                        }
                        self.fill_write_pipeline().await
                    }
                    Err(err) => {
                        log::warn!("closing write stream after undecodable message: {err}");
                        if state
                            .write_stream
                            .stream_mut()
                            .handle_closed(generation, Some(err.clone()))
                        {
                            return self.on_write_stream_close(state, Some(err)).await;
                        }
                        Ok(())
                    }
                }
            }
            StreamEvent::Closed(error) => {
                let mut state = self.inner.state.lock().await;
                if state
                    .write_stream
                    .stream_mut()
                    .handle_closed(generation, error.clone())
                {
                    return self.on_write_stream_close(state, error).await;
                }
                Ok(())
            }
            StreamEvent::BackoffElapsed => {
                let mut state = self.inner.state.lock().await;
                state.write_stream.stream_mut().handle_backoff_elapsed(generation);
                Ok(())
            }
            StreamEvent::IdleTimeout => {
                let mut state = self.inner.state.lock().await;
                if state.write_stream.stream_mut().handle_idle_timeout(generation) {
                    return self.on_write_stream_close(state, None).await;
                }
                Ok(())
            }
        }
    }

    async fn on_write_handshake_complete(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        self.inner
            .local_store
            .set_last_stream_token(state.write_stream.last_stream_token().to_vec())
            .await?;
        for batch in &state.write_pipeline {
            state.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_write_stream_close(
        &self,
        mut state: MutexGuard<'_, RemoteStoreState>,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let handshake_complete = state.write_stream.handshake_complete();
        state.write_stream.reset();

        if let Some(error) = error {
            if !state.write_pipeline.is_empty() {
                if handshake_complete {
                    if is_permanent_write_error(error.code) {
                        // The batch at the head caused the failure; drop it
                        // and retry the rest immediately.
                        let batch = state.write_pipeline.pop_front();
                        state.write_stream.stream_mut().inhibit_backoff();
                        drop(state);
                        if let (Some(batch), Some(syncer)) = (batch, self.syncer()) {
                            log::debug!("batch {} rejected by the backend: {error}", batch.batch_id);
                            syncer.reject_failed_write(batch.batch_id, error).await?;
                        }
                        return self.fill_write_pipeline().await;
                    }
                } else if is_permanent_error(error.code) {
                    log::debug!("write handshake failed, resetting stream token: {error}");
                    state.write_stream.set_last_stream_token(Vec::new());
                    self.inner.local_store.set_last_stream_token(Vec::new()).await?;
                }
            }
        }

        if state.should_start_write_stream() {
            state.write_stream.stream_mut().start();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, TargetPurpose};
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::MemoryPersistence;
    use crate::firestore::model::{BatchId, DatabaseId, Mutation, ResourcePath};
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::remote::stream::{
        AcceptedStream, InMemoryTransport, MultiplexedConnection,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};
    use async_channel::{Receiver, Sender};
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;

    #[derive(Debug)]
    enum SyncerCall {
        RemoteEvent(RemoteEvent),
        RejectListen(TargetId, FirestoreErrorCode),
        WriteAcknowledged(BatchId),
        WriteRejected(BatchId, FirestoreErrorCode),
        OnlineState(OnlineState),
    }

    struct RecordingSyncer {
        calls: Sender<SyncerCall>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.calls.send(SyncerCall::RemoteEvent(event)).await;
                Ok(())
            })
        }

        fn reject_listen(
            &self,
            target_id: TargetId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self
                    .calls
                    .send(SyncerCall::RejectListen(target_id, error.code))
                    .await;
                Ok(())
            })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self
                    .calls
                    .send(SyncerCall::WriteAcknowledged(result.batch.batch_id))
                    .await;
                Ok(())
            })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self
                    .calls
                    .send(SyncerCall::WriteRejected(batch_id, error.code))
                    .await;
                Ok(())
            })
        }

        fn get_remote_keys_for_target(
            &self,
            _target_id: TargetId,
        ) -> RemoteStoreFuture<'_, BTreeSet<DocumentKey>> {
            box_remote_store_future(async { BTreeSet::new() })
        }

        fn apply_online_state_change(
            &self,
            online_state: OnlineState,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.calls.send(SyncerCall::OnlineState(online_state)).await;
                Ok(())
            })
        }

        fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }
    }

    struct Harness {
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        server: MultiplexedConnection,
        calls: Receiver<SyncerCall>,
        _syncer: Arc<RecordingSyncer>,
    }

    async fn harness() -> Harness {
        let queue = AsyncQueue::new();
        let settings = SyncSettings::default();
        let local_store = Arc::new(
            LocalStore::start(Arc::new(MemoryPersistence::new()), User::unauthenticated(), &settings)
                .await
                .unwrap(),
        );
        let (client, server) = InMemoryTransport::pair();
        let (sender, calls) = async_channel::unbounded();
        let syncer = Arc::new(RecordingSyncer { calls: sender });
        let weak_syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        let remote_store = RemoteStore::new(
            queue.clone(),
            Arc::clone(&local_store),
            Arc::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))),
            Arc::new(MultiplexedConnection::new(client)),
            Arc::new(EmptyCredentialsProvider),
            weak_syncer,
            &settings,
        );
        Harness {
            queue,
            local_store,
            remote_store,
            server: MultiplexedConnection::new(server),
            calls,
            _syncer: syncer,
        }
    }

    impl Harness {
        /// Runs `operation` on the queue and waits for it.
        async fn run<F, Fut>(&self, operation: F)
        where
            F: FnOnce(RemoteStore) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
        {
            let store = self.remote_store.clone();
            self.queue.enqueue(move || operation(store)).await.unwrap();
        }

        async fn next_non_online_call(&self) -> SyncerCall {
            loop {
                let call = tokio::time::timeout(Duration::from_secs(5), self.calls.recv())
                    .await
                    .expect("syncer call")
                    .unwrap();
                if !matches!(call, SyncerCall::OnlineState(_)) {
                    return call;
                }
            }
        }
    }

    async fn recv_json(stream: &AcceptedStream) -> JsonValue {
        let payload = tokio::time::timeout(Duration::from_secs(5), stream.stream.next())
            .await
            .expect("message")
            .expect("open stream")
            .expect("payload");
        serde_json::from_slice(&payload).unwrap()
    }

    async fn send_json(stream: &AcceptedStream, value: JsonValue) {
        stream
            .stream
            .send(serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();
    }

    fn listen_target(target_id: TargetId) -> TargetData {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
    }

    #[tokio::test]
    async fn listen_opens_watch_stream_and_raises_snapshots() {
        let harness = harness().await;
        harness
            .run(|store| async move {
                store.start().await?;
                store.listen(listen_target(2)).await
            })
            .await;

        let stream = harness.server.accept().await.expect("listen stream");
        assert_eq!(stream.channel, "listen");
        let request = recv_json(&stream).await;
        assert_eq!(request["addTargets"][0]["targetId"], json!(2));

        send_json(&stream, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } })).await;
        send_json(
            &stream,
            json!({
                "documentChange": {
                    "document": {
                        "name": "projects/p/databases/(default)/documents/rooms/a",
                        "fields": { "n": { "integerValue": "1" } },
                        "createTime": "2024-01-01T00:00:01Z",
                        "updateTime": "2024-01-01T00:00:01Z"
                    },
                    "targetIds": [2]
                }
            }),
        )
        .await;
        send_json(
            &stream,
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "dG9r" } }),
        )
        .await;
        send_json(
            &stream,
            json!({ "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "2024-01-01T00:00:02Z" } }),
        )
        .await;

        let SyncerCall::RemoteEvent(event) = harness.next_non_online_call().await else {
            panic!("expected a remote event");
        };
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert_eq!(change.resume_token, b"tok".to_vec());
        assert_eq!(harness.remote_store.online_state().await, OnlineState::Online);
    }

    #[tokio::test]
    async fn removed_target_with_cause_is_rejected() {
        let harness = harness().await;
        harness
            .run(|store| async move {
                store.start().await?;
                store.listen(listen_target(2)).await
            })
            .await;
        let stream = harness.server.accept().await.expect("listen stream");
        recv_json(&stream).await;

        send_json(
            &stream,
            json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .await;
        match harness.next_non_online_call().await {
            SyncerCall::RejectListen(2, FirestoreErrorCode::PermissionDenied) => {}
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn writes_follow_the_handshake_and_are_acknowledged() {
        let harness = harness().await;
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(1));
        let batch = harness
            .local_store
            .write_locally(vec![Mutation::set(key, MapValue::new(fields))])
            .await
            .unwrap();

        harness
            .run(|store| async move {
                store.start().await?;
                store.fill_write_pipeline().await
            })
            .await;

        let stream = harness.server.accept().await.expect("write stream");
        assert_eq!(stream.channel, "write");
        let handshake = recv_json(&stream).await;
        assert_eq!(handshake, json!({ "database": "projects/p/databases/(default)" }));
        send_json(&stream, json!({ "streamToken": "czE=" })).await;

        let write = recv_json(&stream).await;
        assert_eq!(write["streamToken"], json!("czE="));
        assert_eq!(write["writes"].as_array().unwrap().len(), 1);
        send_json(
            &stream,
            json!({
                "streamToken": "czI=",
                "commitTime": "2024-01-01T00:00:03Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:03Z" }]
            }),
        )
        .await;

        match harness.next_non_online_call().await {
            SyncerCall::WriteAcknowledged(batch_id) => assert_eq!(batch_id, batch.batch_id),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_head_batch() {
        let harness = harness().await;
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let batch = harness
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .await
            .unwrap();
        harness
            .run(|store| async move {
                store.start().await?;
                store.fill_write_pipeline().await
            })
            .await;

        let stream = harness.server.accept().await.expect("write stream");
        recv_json(&stream).await;
        send_json(&stream, json!({ "streamToken": "czE=" })).await;
        recv_json(&stream).await;
        stream.stream.fail(permission_denied("no")).await.unwrap();

        match harness.next_non_online_call().await {
            SyncerCall::WriteRejected(batch_id, FirestoreErrorCode::PermissionDenied) => {
                assert_eq!(batch_id, batch.batch_id)
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabling_network_reports_offline() {
        let harness = harness().await;
        harness
            .run(|store| async move {
                store.start().await?;
                store.disable_network().await
            })
            .await;
        assert!(!harness.remote_store.can_use_network().await);
        assert_eq!(harness.remote_store.online_state().await, OnlineState::Offline);
    }
}
