//! The sync engine ties the local store, the remote store and the views of
//! active queries together.
//!
//! It runs on the async queue like everything else. Its own state sits
//! behind one lock that is never held while calling into the remote store,
//! because the remote store asks back for target metadata. Calls the remote
//! store needs are collected as [`Effects`] and issued after the lock is
//! released.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{Query, TargetData, TargetIdGenerator, TargetPurpose, User};
use crate::firestore::error::{
    cancelled, ignore_if_primary_lease_loss, FirestoreError, FirestoreResult,
};
use crate::firestore::local::{DocumentMap, LocalStore, LocalViewChanges, ReferenceSet};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::remote::{
    box_remote_store_future, CredentialsProviderArc, JsonProtoSerializer, OnlineState,
    RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer, StreamConnection, TargetChange,
};
use crate::firestore::settings::SyncSettings;
use crate::util::async_queue::AsyncQueue;
use crate::util::hard_assert;

/// Receives what the sync engine produces for the application.
#[async_trait]
pub trait SyncEngineListener: Send + Sync + 'static {
    async fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the target of `query`; the query is gone.
    async fn on_watch_error(&self, query: &Query, error: FirestoreError);

    async fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves with the outcome of a write once the backend acknowledged or
/// rejected it.
pub type WriteAcknowledgement = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A dedicated single-document target that settles whether a limbo
/// document exists.
struct LimboResolution {
    key: DocumentKey,
    /// The target delivered the document, so it is in the target's result
    /// set and existence filters expect it.
    received_document: bool,
}

enum RemoteOp {
    Listen(TargetData),
    Unlisten(TargetId),
}

/// Work to do once the state lock is released.
#[derive(Default)]
struct Effects {
    remote_ops: Vec<RemoteOp>,
    online_state: Option<OnlineState>,
    errors: Vec<(Query, FirestoreError)>,
    snapshots: Vec<ViewSnapshot>,
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    /// Views by query canonical id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    max_concurrent_limbo_resolutions: usize,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    /// Write callbacks by user storage key and batch.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    /// Callbacks waiting for every batch up to and including the key.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    listener: Option<Weak<dyn SyncEngineListener>>,
}

impl SyncEngineState {
    fn new(current_user: User, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            current_user,
            online_state: OnlineState::Unknown,
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            max_concurrent_limbo_resolutions,
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_ids: TargetIdGenerator::for_sync_engine(),
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            listener: None,
        }
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
        effects: &mut Effects,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, effects);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} no longer in limbo");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, effects);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, effects: &mut Effects) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(effects);
    }

    /// Starts resolutions for enqueued limbo documents while slots are free.
    fn pump_enqueued_limbo_resolutions(&mut self, effects: &mut Effects) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_ids.next();
            log::debug!("resolving limbo document {key} with target {target_id}");
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            let target = Query::for_document(&key).to_target();
            effects.remote_ops.push(RemoteOp::Listen(TargetData::new(
                target,
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, effects: &mut Effects) {
        self.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        effects.remote_ops.push(RemoteOp::Unlisten(target_id));
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(effects);
    }

    /// Drops the resolution whose target the backend rejected and returns
    /// its document. The target is already gone on the backend.
    fn remove_rejected_limbo_target(
        &mut self,
        target_id: TargetId,
        effects: &mut Effects,
    ) -> Option<DocumentKey> {
        let resolution = self.active_limbo_resolutions_by_target.remove(&target_id)?;
        self.active_limbo_targets_by_key.remove(&resolution.key);
        self.pump_enqueued_limbo_resolutions(effects);
        Some(resolution.key)
    }

    /// Forgets every query of `target_id`, reporting `error` to their
    /// listeners if given.
    fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        error: Option<FirestoreError>,
        effects: &mut Effects,
    ) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                effects.errors.push((query, error.clone()));
            }
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, effects);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = self.current_user.storage_key();
        let callback = self
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.doc_changes {
        let key = change.document.key().clone();
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(key);
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(key);
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    /// Creates the engine together with the remote store it drives.
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        serializer: Arc<JsonProtoSerializer>,
        connection: Arc<dyn StreamConnection>,
        credentials: CredentialsProviderArc,
        current_user: User,
        settings: &SyncSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SyncEngine>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            let remote_store = RemoteStore::new(
                queue,
                Arc::clone(&local_store),
                serializer,
                connection,
                credentials,
                syncer,
                settings,
            );
            SyncEngine {
                local_store,
                remote_store,
                state: Mutex::new(SyncEngineState::new(
                    current_user,
                    settings.max_concurrent_limbo_resolutions,
                )),
            }
        })
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub async fn subscribe(&self, listener: Weak<dyn SyncEngineListener>) {
        self.state.lock().await.listener = Some(listener);
    }

    /// Starts listening to `query` and returns its first snapshot. A query
    /// that is already active gets a snapshot of the existing view.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let mut effects = Effects::default();
        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                return Ok(query_view.view.compute_initial_snapshot());
            }
            let target_data = self.local_store.allocate_target(query.to_target()).await?;
            log::debug!("listening to {query} with target {}", target_data.target_id);
            let snapshot = self
                .initialize_view(
                    &mut state,
                    query,
                    target_data.target_id,
                    target_data.resume_token.clone(),
                    &mut effects,
                )
                .await?;
            effects.remote_ops.push(RemoteOp::Listen(target_data));
            snapshot
        };
        self.run_effects(effects).await?;
        Ok(snapshot)
    }

    async fn initialize_view(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        resume_token: Vec<u8>,
        effects: &mut Effects,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None)?;
        // A new view is never current until the backend says so.
        let synthesized = TargetChange::synthesized_for_current_change(false, resume_token);
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        state.update_tracked_limbos(target_id, view_change.limbo_changes, effects);
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| crate::util::fail("a new view must raise a snapshot"))?;

        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        Ok(snapshot)
    }

    /// Stops listening to `query`. The target is released once no other
    /// query shares it.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            let canonical_id = query.canonical_id();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
                log::debug!("unlisten of inactive query {query}");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }

            if let Err(err) = self.local_store.release_target(target_id, false).await {
                return ignore_if_primary_lease_loss(Err(err));
            }
            effects.remote_ops.push(RemoteOp::Unlisten(target_id));
            state.remove_and_cleanup_target(target_id, None, &mut effects);
        }
        self.run_effects(effects).await
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// returned receiver resolves once the backend accepted or rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteAcknowledgement> {
        let (sender, receiver) = oneshot::channel();
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            let result = match self.local_store.write_locally(mutations).await {
                Ok(result) => result,
                Err(err) => {
                    log::warn!("failed to persist write: {err}");
                    return Err(err);
                }
            };
            let user_key = state.current_user.storage_key();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, sender);
            self.emit_new_snaps_and_notify_local_store(&mut state, &result.changes, None, &mut effects)
                .await?;
        }
        self.run_effects(effects).await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    /// Resolves once every write pending at the time of the call is
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> FirestoreResult<WriteAcknowledgement> {
        if !self.remote_store.can_use_network().await {
            log::debug!("network is disabled; pending writes wait until it is enabled");
        }
        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.highest_unacknowledged_batch_id().await?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
            return Ok(receiver);
        }
        self.state
            .lock()
            .await
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.remote_store.enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.remote_store.disable_network().await
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.remote_store.shutdown().await?;
        let mut state = self.state.lock().await;
        state.reject_outstanding_pending_writes_callbacks("The client was shut down");
        state.listener = None;
        Ok(())
    }

    /// Limbo documents being resolved and their targets.
    pub async fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state.lock().await.active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a resolution slot.
    pub async fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    /// Recomputes every view against `changes`, records what each view now
    /// shows in the local store, and collects the resulting snapshots.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        if state.query_views.is_empty() {
            return Ok(());
        }
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill {
                // Documents past the limit may now fall inside it.
                let result = self
                    .local_store
                    .execute_query(&query_view.query, false)
                    .await?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes))?;
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset =
                remote_event.map_or(false, |event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
            state.update_tracked_limbos(target_id, view_change.limbo_changes, effects);
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                effects.snapshots.push(snapshot);
            }
        }
        self.local_store.notify_local_view_changes(view_changes).await
    }

    async fn run_effects(&self, effects: Effects) -> FirestoreResult<()> {
        for op in effects.remote_ops {
            match op {
                RemoteOp::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteOp::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        let listener = self
            .state
            .lock()
            .await
            .listener
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(listener) = listener else {
            return Ok(());
        };
        if let Some(online_state) = effects.online_state {
            listener.on_online_state_change(online_state).await;
        }
        for (query, error) in effects.errors {
            listener.on_watch_error(&query, error).await;
        }
        if !effects.snapshots.is_empty() {
            listener.on_watch_change(effects.snapshots).await;
        }
        Ok(())
    }

    async fn handle_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            let changes = match self.local_store.apply_remote_event(&event).await {
                Ok(changes) => changes,
                Err(err) => return ignore_if_primary_lease_loss(Err(err)),
            };
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                hard_assert(
                    change.added_documents.len()
                        + change.modified_documents.len()
                        + change.removed_documents.len()
                        <= 1,
                    "limbo resolution for a single document contains multiple changes",
                )?;
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "received change for limbo target document without add",
                    )?;
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "received remove for limbo target document without add",
                    )?;
                    resolution.received_document = false;
                }
            }
            self.emit_new_snaps_and_notify_local_store(&mut state, &changes, Some(&event), &mut effects)
                .await?;
        }
        self.run_effects(effects).await
    }

    async fn handle_rejected_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let limbo_key = self
            .state
            .lock()
            .await
            .remove_rejected_limbo_target(target_id, &mut effects);

        match limbo_key {
            Some(key) => {
                log::debug!("limbo resolution for {key} rejected: {error}");
                self.run_effects(std::mem::take(&mut effects)).await?;
                // Without access the document is treated as deleted.
                let mut event = RemoteEvent::default();
                event.document_updates.insert(
                    key.clone(),
                    MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
                );
                event.resolved_limbo_documents.insert(key);
                self.handle_remote_event(event).await?;
            }
            None => {
                log::debug!("listen for target {target_id} rejected: {error}");
                let mut state = self.state.lock().await;
                if let Err(err) = self.local_store.release_target(target_id, false).await {
                    return ignore_if_primary_lease_loss(Err(err));
                }
                state.remove_and_cleanup_target(target_id, Some(error), &mut effects);
            }
        }
        self.run_effects(effects).await
    }

    async fn handle_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            let changes = match self.local_store.acknowledge_batch(result).await {
                Ok(changes) => changes,
                Err(err) => return ignore_if_primary_lease_loss(Err(err)),
            };
            state.process_user_callback(batch_id, Ok(()));
            state.trigger_pending_writes_callbacks(batch_id);
            self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None, &mut effects)
                .await?;
        }
        self.run_effects(effects).await
    }

    async fn handle_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            let changes = match self.local_store.reject_batch(batch_id).await {
                Ok(changes) => changes,
                Err(err) => return ignore_if_primary_lease_loss(Err(err)),
            };
            state.process_user_callback(batch_id, Err(error));
            state.trigger_pending_writes_callbacks(batch_id);
            self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None, &mut effects)
                .await?;
        }
        self.run_effects(effects).await
    }

    async fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.state.lock().await;
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    async fn handle_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            for query_view in state.query_views.values_mut() {
                if let Some(snapshot) = query_view.view.apply_online_state_change(online_state).snapshot {
                    effects.snapshots.push(snapshot);
                }
            }
            state.online_state = online_state;
            effects.online_state = Some(online_state);
        }
        self.run_effects(effects).await
    }

    async fn handle_user_change(&self, user: User) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock().await;
            if state.current_user == user {
                return Ok(());
            }
            log::debug!("user changed to {user}");
            let result = self.local_store.handle_user_change(user.clone()).await?;
            state.current_user = user;
            state.reject_outstanding_pending_writes_callbacks(
                "Pending writes are no longer awaited after a user change",
            );
            self.emit_new_snaps_and_notify_local_store(
                &mut state,
                &result.affected_documents,
                None,
                &mut effects,
            )
            .await?;
        }
        self.run_effects(effects).await
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_remote_event(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_rejected_listen(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_successful_write(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_failed_write(batch_id, error))
    }

    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> RemoteStoreFuture<'_, BTreeSet<DocumentKey>> {
        box_remote_store_future(self.remote_keys_for_target(target_id))
    }

    fn apply_online_state_change(
        &self,
        online_state: OnlineState,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_online_state_change(online_state))
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_user_change(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::MemoryPersistence;
    use crate::firestore::model::{DatabaseId, ResourcePath, Timestamp};
    use crate::firestore::remote::{
        EmptyCredentialsProvider, InMemoryTransport, MultiplexedConnection,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: std::sync::Mutex<Vec<ViewSnapshot>>,
        errors: std::sync::Mutex<Vec<(String, FirestoreErrorCode)>>,
    }

    #[async_trait]
    impl SyncEngineListener for RecordingListener {
        async fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        async fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error.code));
        }

        async fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
        // Keeps the loopback link open.
        _server: Arc<InMemoryTransport>,
    }

    async fn harness() -> Harness {
        let settings = SyncSettings::default();
        let local_store = Arc::new(
            LocalStore::start(Arc::new(MemoryPersistence::new()), User::unauthenticated(), &settings)
                .await
                .unwrap(),
        );
        let (client, server) = InMemoryTransport::pair();
        let engine = SyncEngine::new(
            AsyncQueue::new(),
            local_store,
            Arc::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))),
            Arc::new(MultiplexedConnection::new(client)),
            Arc::new(EmptyCredentialsProvider),
            User::unauthenticated(),
            &settings,
        );
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn SyncEngineListener> = Arc::downgrade(&listener) as Weak<dyn SyncEngineListener>;
        engine.subscribe(weak).await;
        Harness {
            engine,
            listener,
            _server: server,
        }
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn set(path: &str, n: i64) -> Mutation {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(n));
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::new(fields))
    }

    #[tokio::test]
    async fn local_write_raises_snapshot_with_pending_writes() {
        let Harness { engine, listener, _server } = harness().await;
        let initial = engine.listen(rooms()).await.unwrap();
        assert!(initial.docs.is_empty());
        assert!(initial.from_cache);

        engine.write(vec![set("rooms/a", 1)]).await.unwrap();
        let snapshots = listener.snapshots.lock().unwrap().clone();
        let last = snapshots.last().expect("snapshot after write");
        assert_eq!(last.docs.len(), 1);
        assert!(last.has_pending_writes());
        assert_eq!(last.doc_changes[0].change_type, ChangeType::Added);
    }

    #[tokio::test]
    async fn rejected_write_reverts_view_and_fails_callback() {
        let Harness { engine, listener, _server } = harness().await;
        engine.listen(rooms()).await.unwrap();
        let acknowledgement = engine.write(vec![set("rooms/a", 1)]).await.unwrap();
        let batch_id = engine
            .local_store()
            .highest_unacknowledged_batch_id()
            .await
            .unwrap();

        engine
            .reject_failed_write(batch_id, permission_denied("denied"))
            .await
            .unwrap();
        let err = acknowledgement.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        let last = listener.snapshots.lock().unwrap().last().cloned().unwrap();
        assert!(last.docs.is_empty());
        assert_eq!(last.doc_changes[0].change_type, ChangeType::Removed);
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_and_forgets_query() {
        let Harness { engine, listener, _server } = harness().await;
        engine.listen(rooms()).await.unwrap();
        let target_id = engine
            .local_store()
            .get_target_data(&rooms().to_target())
            .await
            .unwrap()
            .expect("allocated target")
            .target_id;

        engine
            .reject_listen(target_id, permission_denied("denied"))
            .await
            .unwrap();
        let errors = listener.errors.lock().unwrap().clone();
        assert_eq!(errors, vec![(rooms().canonical_id(), FirestoreErrorCode::PermissionDenied)]);
        assert!(engine.remote_keys_for_target(target_id).await.is_empty());
    }

    #[tokio::test]
    async fn limbo_documents_are_resolved_through_dedicated_targets() {
        let Harness { engine, _server, .. } = harness().await;
        engine.listen(rooms()).await.unwrap();
        let target_id = engine
            .local_store()
            .get_target_data(&rooms().to_target())
            .await
            .unwrap()
            .unwrap()
            .target_id;

        // The backend reports one document and marks the target current.
        let key_a = DocumentKey::from_string("rooms/a").unwrap();
        let version = SnapshotVersion::new(Timestamp::new(10, 0));
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(1));
        let mut event = RemoteEvent {
            snapshot_version: version,
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            current: true,
            resume_token: b"t1".to_vec(),
            ..TargetChange::default()
        };
        change.added_documents.insert(key_a.clone());
        event.target_changes.insert(target_id, change);
        event.document_updates.insert(
            key_a.clone(),
            MutableDocument::new_found_document(key_a.clone(), version, version, MapValue::new(fields)),
        );
        engine.apply_remote_event(event).await.unwrap();
        assert!(engine.active_limbo_document_resolutions().await.is_empty());

        // A new snapshot drops the document from the target without
        // deleting it, which puts the cached copy into limbo.
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::new(Timestamp::new(11, 0)),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        change.removed_documents.insert(key_a.clone());
        event.target_changes.insert(target_id, change);
        engine.apply_remote_event(event).await.unwrap();

        let active = engine.active_limbo_document_resolutions().await;
        let limbo_target = *active.get(&key_a).expect("limbo resolution started");
        assert_eq!(limbo_target % 2, 1);

        // The limbo target reports the document as deleted.
        let deleted_at = SnapshotVersion::new(Timestamp::new(12, 0));
        let mut event = RemoteEvent {
            snapshot_version: deleted_at,
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            limbo_target,
            TargetChange {
                current: true,
                ..TargetChange::default()
            },
        );
        event.document_updates.insert(
            key_a.clone(),
            MutableDocument::new_no_document(key_a.clone(), deleted_at),
        );
        event.resolved_limbo_documents.insert(key_a.clone());
        engine.apply_remote_event(event).await.unwrap();
        assert!(engine.active_limbo_document_resolutions().await.is_empty());
        assert!(engine.enqueued_limbo_document_resolutions().await.is_empty());
    }

    #[test]
    fn rejected_limbo_target_frees_its_slot_without_unwatching() {
        let mut state = SyncEngineState::new(User::unauthenticated(), 1);
        let key_a = DocumentKey::from_string("rooms/a").unwrap();
        let key_b = DocumentKey::from_string("rooms/b").unwrap();
        let mut effects = Effects::default();
        state.update_tracked_limbos(
            2,
            vec![
                LimboDocumentChange::Added(key_a.clone()),
                LimboDocumentChange::Added(key_b.clone()),
            ],
            &mut effects,
        );
        assert_eq!(effects.remote_ops.len(), 1);
        let limbo_target = state.active_limbo_targets_by_key[&key_a];

        let mut effects = Effects::default();
        assert_eq!(
            state.remove_rejected_limbo_target(limbo_target, &mut effects),
            Some(key_a.clone())
        );
        let next_target = state.active_limbo_targets_by_key[&key_b];
        assert!(matches!(
            effects.remote_ops.as_slice(),
            [RemoteOp::Listen(data)] if data.target_id == next_target
        ));

        // The synthesized deletion then takes the document out of the view.
        let mut effects = Effects::default();
        state.update_tracked_limbos(2, vec![LimboDocumentChange::Removed(key_a)], &mut effects);
        assert!(effects.remote_ops.is_empty());
        assert!(state.enqueued_limbo_resolutions.is_empty());
    }

    #[tokio::test]
    async fn pending_writes_callback_resolves_without_writes() {
        let Harness { engine, _server, .. } = harness().await;
        let receiver = engine.register_pending_writes_callback().await.unwrap();
        assert!(receiver.await.unwrap().is_ok());
    }
}
