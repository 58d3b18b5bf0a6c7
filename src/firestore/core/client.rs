use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, ListenerRegistration, SnapshotsInSyncRegistration,
};
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{Query, User};
use crate::firestore::error::{cancelled, internal_error, FirestoreResult};
use crate::firestore::local::{DocumentMap, LocalStore, Persistence};
use crate::firestore::model::{DatabaseId, DocumentKey, FieldIndex, MutableDocument, Mutation};
use crate::firestore::remote::{CredentialsProviderArc, JsonProtoSerializer, StreamConnection};
use crate::firestore::settings::SyncSettings;
use crate::platform::runtime;
use crate::util::async_queue::AsyncQueue;
use crate::util::fail;

/// What a [`SyncClient`] is built from.
pub struct SyncClientConfig {
    pub database_id: DatabaseId,
    pub persistence: Arc<dyn Persistence>,
    pub connection: Arc<dyn StreamConnection>,
    pub credentials: CredentialsProviderArc,
    pub settings: SyncSettings,
}

/// Entry point of the crate: owns the async queue and runs every operation
/// of the local store, the sync engine and the event manager on it.
pub struct SyncClient {
    queue: AsyncQueue,
    credentials: CredentialsProviderArc,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
}

impl SyncClient {
    /// Opens the persistence layer for the current user and starts syncing.
    pub async fn start(config: SyncClientConfig) -> FirestoreResult<Self> {
        let SyncClientConfig {
            database_id,
            persistence,
            connection,
            credentials,
            settings,
        } = config;
        let queue = AsyncQueue::with_retry_policy(settings.max_storage_retries, settings.backoff.clone());

        let (user_sender, user_receiver) = async_channel::unbounded::<User>();
        credentials.set_change_listener(Arc::new(move |user| {
            let _ = user_sender.try_send(user);
        }));
        let initial_user = user_receiver
            .recv()
            .await
            .map_err(|_| internal_error("credentials provider never reported a user"))?;
        log::debug!("starting sync client for {initial_user}");

        let serializer = Arc::new(JsonProtoSerializer::new(database_id));
        let engine_queue = queue.clone();
        let engine_credentials = Arc::clone(&credentials);
        let (local_store, sync_engine, event_manager) = queue
            .enqueue(move || async move {
                let local_store =
                    Arc::new(LocalStore::start(persistence, initial_user.clone(), &settings).await?);
                let sync_engine = SyncEngine::new(
                    engine_queue,
                    Arc::clone(&local_store),
                    serializer,
                    connection,
                    engine_credentials,
                    initial_user,
                    &settings,
                );
                let event_manager = EventManager::new(Arc::clone(&sync_engine));
                let listener: Weak<dyn SyncEngineListener> =
                    Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>;
                sync_engine.subscribe(listener).await;
                sync_engine.remote_store().start().await?;
                Ok((local_store, sync_engine, event_manager))
            })
            .await?;

        spawn_user_change_forwarder(queue.clone(), Arc::downgrade(&sync_engine), user_receiver);

        Ok(Self {
            queue,
            credentials,
            local_store,
            sync_engine,
            event_manager,
        })
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    /// Subscribes to `query`. Events are read from the returned handle.
    /// Transient storage failures while starting the query are retried.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> FirestoreResult<ListenerRegistration> {
        let event_manager = Arc::clone(&self.event_manager);
        let queue = self.queue.clone();
        self.queue
            .enqueue_retryable(move || {
                let event_manager = Arc::clone(&event_manager);
                let queue = queue.clone();
                let query = query.clone();
                async move { event_manager.listen(queue, query, options).await }
            })
            .await
    }

    /// Applies `mutations` locally right away and resolves once the backend
    /// accepted them. Rejections surface as the returned error.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        let acknowledgement = self
            .queue
            .enqueue(move || async move { sync_engine.write(mutations).await })
            .await?;
        acknowledgement
            .await
            .map_err(|_| cancelled("The client was terminated before the write was acknowledged"))?
    }

    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<MutableDocument> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue_retryable(move || {
                let local_store = Arc::clone(&local_store);
                let key = key.clone();
                async move { local_store.read_document(&key).await }
            })
            .await
    }

    pub async fn get_documents_from_local_cache_by_keys(
        &self,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue_retryable(move || {
                let local_store = Arc::clone(&local_store);
                let keys = keys.clone();
                async move { local_store.get_documents(&keys).await }
            })
            .await
    }

    /// Runs `query` against the cache only and returns the result as a
    /// snapshot flagged as coming from cache.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue_retryable(move || {
                let local_store = Arc::clone(&local_store);
                let query = query.clone();
                async move {
                    let result = local_store.execute_query(&query, true).await?;
                    let mut view = View::new(query, result.remote_keys);
                    let changes = view.compute_doc_changes(&result.documents, None)?;
                    view.apply_changes(changes, false, None, false)
                        .snapshot
                        .ok_or_else(|| fail("a new view must raise a snapshot"))
                }
            })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || async move { sync_engine.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || async move { sync_engine.disable_network().await })
            .await
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        let receiver = self
            .queue
            .enqueue(move || async move { sync_engine.register_pending_writes_callback().await })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated while waiting for pending writes"))?
    }

    pub async fn add_snapshots_in_sync_listener(&self) -> FirestoreResult<SnapshotsInSyncRegistration> {
        let event_manager = Arc::clone(&self.event_manager);
        let queue = self.queue.clone();
        self.queue
            .enqueue(move || async move { Ok(event_manager.add_snapshots_in_sync_listener(queue).await) })
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move { local_store.configure_field_indexes(indexes).await })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                local_store.set_index_auto_creation_enabled(enabled).await;
                Ok(())
            })
            .await
    }

    /// Removes cached documents nothing refers to anymore.
    pub async fn collect_garbage(&self) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move { local_store.collect_garbage().await })
            .await
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Shuts the client down after the queued operations ran. Later calls
    /// fail with `Cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.credentials.remove_change_listener();
        let sync_engine = Arc::clone(&self.sync_engine);
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue_and_initiate_shutdown(move || async move {
                sync_engine.shutdown().await?;
                local_store.shutdown().await
            })
            .await
    }
}

/// Forwards user changes after the initial one to the remote store, which
/// restarts its streams for the new identity.
fn spawn_user_change_forwarder(
    queue: AsyncQueue,
    sync_engine: Weak<SyncEngine>,
    users: async_channel::Receiver<User>,
) {
    runtime::spawn_detached(async move {
        while let Ok(user) = users.recv().await {
            if queue.is_shutting_down() {
                break;
            }
            let Some(sync_engine) = sync_engine.upgrade() else {
                break;
            };
            queue.enqueue_and_forget(move || async move {
                sync_engine.remote_store().handle_credential_change(user).await
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::MemoryPersistence;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::remote::{EmptyCredentialsProvider, InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::{FirestoreValue, MapValue};

    async fn client() -> (SyncClient, Arc<InMemoryTransport>) {
        let (transport, server) = InMemoryTransport::pair();
        let client = SyncClient::start(SyncClientConfig {
            database_id: DatabaseId::new("p", "(default)"),
            persistence: Arc::new(MemoryPersistence::new()),
            connection: Arc::new(MultiplexedConnection::new(transport)),
            credentials: Arc::new(EmptyCredentialsProvider),
            settings: SyncSettings::default(),
        })
        .await
        .unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn offline_write_is_visible_in_cache() {
        let (client, _server) = client().await;
        client.disable_network().await.unwrap();

        let key = DocumentKey::from_string("c/1").unwrap();
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("a"));
        let mutation = Mutation::set(key.clone(), MapValue::new(fields));

        // The write stays pending while offline.
        let sync_engine = Arc::clone(client.sync_engine());
        let pending = client.queue.enqueue(move || async move { sync_engine.write(vec![mutation]).await });
        let _acknowledgement = pending.await.unwrap();

        let document = client.get_document_from_local_cache(key).await.unwrap();
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());

        let query = Query::new(ResourcePath::from_string("c").unwrap());
        let snapshot = client.get_documents_from_local_cache(query).await.unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes());
    }

    #[tokio::test]
    async fn terminated_client_rejects_operations() {
        let (client, _server) = client().await;
        client.terminate().await.unwrap();
        assert!(client.is_terminated());
        let err = client.enable_network().await.unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Cancelled);
    }
}
