//! Fans view snapshots out to the listeners registered per query.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::Query;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;
use crate::util::async_queue::AsyncQueue;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change metadata, such as pending writes
    /// being acknowledged or the view becoming synced.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while the client may be online, instead
    /// of raising a cached result that may be stale.
    pub wait_for_sync_when_online: bool,
}

#[derive(Clone, Debug)]
pub enum ListenEvent {
    Snapshot(ViewSnapshot),
    /// The query failed; no further events follow.
    Error(FirestoreError),
}

struct QueryListener {
    id: u64,
    options: ListenOptions,
    sender: Sender<ListenEvent>,
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn new(id: u64, options: ListenOptions, sender: Sender<ListenEvent>) -> Self {
        Self {
            id,
            options,
            sender,
            raised_initial_event: false,
            snap: None,
            online_state: OnlineState::Unknown,
        }
    }

    /// Returns whether an event was raised.
    fn on_view_snapshot(&mut self, snap: ViewSnapshot) -> bool {
        let snap = if self.options.include_metadata_changes {
            snap
        } else {
            snap.without_metadata_changes()
        };

        let mut raised_event = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snap, self.online_state) {
                self.raise_initial_event(&snap);
                raised_event = true;
            }
        } else if self.should_raise_event(&snap) {
            self.raise(ListenEvent::Snapshot(snap.clone()));
            raised_event = true;
        }
        self.snap = Some(snap);
        raised_event
    }

    fn on_error(&self, error: FirestoreError) {
        self.raise(ListenEvent::Error(error));
        self.sender.close();
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snap) = self.snap.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snap, online_state) {
            self.raise_initial_event(&snap);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snap: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snap.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Cached results are raised unless there is nothing to show and the
        // backend may still deliver something.
        !snap.docs.is_empty() || snap.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snap: &ViewSnapshot) -> bool {
        if !snap.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snap
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snap.has_pending_writes());
        if snap.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snap: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snap.query.clone(),
            snap.docs.clone(),
            snap.mutated_keys.clone(),
            snap.from_cache,
            snap.has_cached_results,
        );
        self.raised_initial_event = true;
        self.raise(ListenEvent::Snapshot(initial));
    }

    fn raise(&self, event: ListenEvent) {
        if self.sender.try_send(event).is_err() {
            log::debug!("listener {} is gone; dropping event", self.id);
        }
    }
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

#[derive(Default)]
struct EventManagerState {
    /// Listeners by query canonical id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync_listeners: BTreeMap<u64, Sender<()>>,
}

impl EventManagerState {
    fn raise_snapshots_in_sync_event(&mut self) {
        self.snapshots_in_sync_listeners
            .retain(|_, sender| sender.try_send(()).is_ok());
    }
}

pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
    next_listener_id: AtomicU64,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            sync_engine,
            state: Mutex::new(EventManagerState::default()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Registers a listener for `query`, starting the query in the sync
    /// engine when it is the first one. Must run on the async queue that
    /// `queue` refers to; the handle uses it to unsubscribe.
    pub async fn listen(
        self: &Arc<Self>,
        queue: AsyncQueue,
        query: Query,
        options: ListenOptions,
    ) -> FirestoreResult<ListenerRegistration> {
        let canonical_id = query.canonical_id();
        let first_listen = !self.state.lock().await.queries.contains_key(&canonical_id);
        let view_snap = if first_listen {
            // The sync engine reports back through this manager, so the
            // state lock is not held across the call.
            match self.sync_engine.listen(query.clone()).await {
                Ok(snapshot) => Ok(Some(snapshot)),
                // Retried by the caller before any listener exists.
                Err(err) if err.is_transient_storage() => return Err(err),
                Err(err) => Err(err),
            }
        } else {
            Ok(None)
        };

        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = async_channel::unbounded();
        let mut listener = QueryListener::new(id, options, sender);
        let registration = ListenerRegistration {
            id,
            query,
            receiver,
            queue,
            event_manager: Arc::downgrade(self),
            removed: false,
        };
        let view_snap = match view_snap {
            Ok(view_snap) => view_snap,
            Err(err) => {
                log::warn!("failed to listen to query: {err}");
                listener.on_error(err);
                return Ok(registration);
            }
        };

        let mut state = self.state.lock().await;
        let online_state = state.online_state;
        let info = state.queries.entry(canonical_id).or_default();
        if view_snap.is_some() {
            info.view_snap = view_snap;
        }
        listener.apply_online_state_change(online_state);
        let raised = match &info.view_snap {
            Some(snap) => listener.on_view_snapshot(snap.clone()),
            None => false,
        };
        info.listeners.push(listener);
        if raised {
            state.raise_snapshots_in_sync_event();
        }
        Ok(registration)
    }

    /// Removes one listener, stopping the query once none is left.
    pub async fn unlisten(&self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let last_listen = {
            let mut state = self.state.lock().await;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.retain(|listener| listener.id != listener_id);
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                true
            } else {
                false
            }
        };
        if last_listen {
            self.sync_engine.unlisten(query).await?;
        }
        Ok(())
    }

    /// Returns a receiver that yields once right away and again whenever
    /// every active listener has seen a consistent snapshot.
    pub async fn add_snapshots_in_sync_listener(self: &Arc<Self>, queue: AsyncQueue) -> SnapshotsInSyncRegistration {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = async_channel::unbounded();
        let _ = sender.try_send(());
        self.state
            .lock()
            .await
            .snapshots_in_sync_listeners
            .insert(id, sender);
        SnapshotsInSyncRegistration {
            id,
            receiver,
            queue,
            event_manager: Arc::downgrade(self),
            removed: false,
        }
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.state.lock().await.snapshots_in_sync_listeners.remove(&id);
    }

    /// Number of queries with at least one listener.
    pub async fn active_query_count(&self) -> usize {
        self.state.lock().await.queries.len()
    }
}

#[async_trait]
impl SyncEngineListener for EventManager {
    async fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut state = self.state.lock().await;
        let mut raised_event = false;
        for snapshot in snapshots {
            let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                if listener.on_view_snapshot(snapshot.clone()) {
                    raised_event = true;
                }
            }
            info.view_snap = Some(snapshot);
        }
        if raised_event {
            state.raise_snapshots_in_sync_event();
        }
    }

    async fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let mut state = self.state.lock().await;
        if let Some(info) = state.queries.remove(&query.canonical_id()) {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    async fn on_online_state_change(&self, online_state: OnlineState) {
        let mut state = self.state.lock().await;
        state.online_state = online_state;
        let mut raised_event = false;
        for info in state.queries.values_mut() {
            for listener in &mut info.listeners {
                if listener.apply_online_state_change(online_state) {
                    raised_event = true;
                }
            }
        }
        if raised_event {
            state.raise_snapshots_in_sync_event();
        }
    }
}

/// Handle returned when listening to a query. Events arrive through
/// [`ListenerRegistration::next`]; calling [`ListenerRegistration::remove`]
/// or dropping the handle unsubscribes.
pub struct ListenerRegistration {
    id: u64,
    query: Query,
    receiver: Receiver<ListenEvent>,
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    removed: bool,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the next event. Returns `None` once the listener is removed
    /// or failed.
    pub async fn next(&self) -> Option<ListenEvent> {
        self.receiver.recv().await.ok()
    }

    /// Returns an event if one is already waiting.
    pub fn try_next(&self) -> Option<ListenEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        self.receiver.close();
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        if self.queue.is_shutting_down() {
            return;
        }
        let query = self.query.clone();
        let id = self.id;
        self.queue
            .enqueue_and_forget(move || async move { event_manager.unlisten(&query, id).await });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Handle for a snapshots-in-sync listener.
pub struct SnapshotsInSyncRegistration {
    id: u64,
    receiver: Receiver<()>,
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    removed: bool,
}

impl SnapshotsInSyncRegistration {
    pub async fn next(&self) -> Option<()> {
        self.receiver.recv().await.ok()
    }

    pub fn try_next(&self) -> Option<()> {
        self.receiver.try_recv().ok()
    }

    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        self.receiver.close();
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        if self.queue.is_shutting_down() {
            return;
        }
        let id = self.id;
        self.queue.enqueue_and_forget(move || async move {
            event_manager.remove_snapshots_in_sync_listener(id).await;
            Ok(())
        });
    }
}

impl Drop for SnapshotsInSyncRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentSet;
    use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn query() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn doc(path: &str) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(1));
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version,
            version,
            MapValue::new(fields),
        )
    }

    fn snapshot(paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut docs = DocumentSet::new(Arc::new(query()));
        for path in paths {
            docs.insert(doc(path));
        }
        ViewSnapshot::from_initial_documents(query(), docs, Default::default(), from_cache, false)
    }

    fn listener(options: ListenOptions) -> (QueryListener, Receiver<ListenEvent>) {
        let (sender, receiver) = async_channel::unbounded();
        (QueryListener::new(1, options, sender), receiver)
    }

    #[test]
    fn synced_snapshot_is_raised_immediately() {
        let (mut listener, receiver) = listener(ListenOptions::default());
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], false)));
        assert!(matches!(receiver.try_recv(), Ok(ListenEvent::Snapshot(_))));
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let (mut listener, receiver) = listener(ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot(&[], true)));
        assert!(receiver.try_recv().is_err());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        match receiver.try_recv() {
            Ok(ListenEvent::Snapshot(snap)) => assert!(snap.from_cache),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn wait_for_sync_holds_back_cached_results_while_online() {
        let (mut listener, receiver) = listener(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(snapshot(&["rooms/a"], true)));
        assert!(receiver.try_recv().is_err());
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], false)));
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (mut plain, plain_events) = listener(ListenOptions::default());
        let (mut with_metadata, metadata_events) = listener(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        for listener in [&mut plain, &mut with_metadata] {
            listener.on_view_snapshot(snapshot(&["rooms/a"], true));
        }
        let _ = plain_events.try_recv();
        let _ = metadata_events.try_recv();

        let mut synced = snapshot(&["rooms/a"], false);
        synced.doc_changes.clear();
        assert!(!plain.on_view_snapshot(synced.clone()));
        assert!(with_metadata.on_view_snapshot(synced));
        assert!(plain_events.try_recv().is_err());
        assert!(metadata_events.try_recv().is_ok());
    }

    #[test]
    fn errors_close_the_channel() {
        let (listener, receiver) = listener(ListenOptions::default());
        listener.on_error(crate::firestore::error::permission_denied("denied"));
        assert!(matches!(receiver.try_recv(), Ok(ListenEvent::Error(_))));
        assert!(receiver.is_closed());
    }
}
