use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use firestore_sync::firestore::local::MemoryPersistence;
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
use firestore_sync::firestore::remote::{
    AcceptedStream, EmptyCredentialsProvider, InMemoryTransport, MultiplexedConnection,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::{ListenEvent, ListenOptions, ListenerRegistration, Query, SyncClient, SyncClientConfig, SyncSettings};
use serde_json::{json, Value as JsonValue};

const ROOM_A: &str = "projects/p/databases/(default)/documents/rooms/a";

struct Backend {
    server: MultiplexedConnection,
}

impl Backend {
    async fn accept(&self, channel: &str) -> AcceptedStream {
        let stream = tokio::time::timeout(Duration::from_secs(5), self.server.accept())
            .await
            .expect("stream opened")
            .expect("connection open");
        assert_eq!(stream.channel, channel);
        stream
    }
}

async fn start() -> (SyncClient, Backend) {
    start_with(Arc::new(MemoryPersistence::new())).await
}

async fn start_with(persistence: Arc<MemoryPersistence>) -> (SyncClient, Backend) {
    let (transport, server) = InMemoryTransport::pair();
    let client = SyncClient::start(SyncClientConfig {
        database_id: DatabaseId::new("p", "(default)"),
        persistence,
        connection: Arc::new(MultiplexedConnection::new(transport)),
        credentials: Arc::new(EmptyCredentialsProvider),
        settings: SyncSettings::default(),
    })
    .await
    .unwrap();
    (
        client,
        Backend {
            server: MultiplexedConnection::new(server),
        },
    )
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

async fn next_snapshot(registration: &ListenerRegistration) -> firestore_sync::firestore::core::ViewSnapshot {
    match tokio::time::timeout(Duration::from_secs(5), registration.next())
        .await
        .expect("event")
        .expect("open listener")
    {
        ListenEvent::Snapshot(snapshot) => snapshot,
        ListenEvent::Error(err) => panic!("unexpected error {err}"),
    }
}

fn rooms() -> Query {
    Query::new(ResourcePath::from_string("rooms").unwrap())
}

fn global_snapshot(read_time: &str) -> JsonValue {
    json!({ "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": read_time } })
}

/// Drives target 2 to a synced state holding `rooms/a`.
async fn sync_room_a(listen: &AcceptedStream) {
    let request = recv_json(listen).await;
    assert_eq!(request["addTargets"][0]["targetId"], json!(2));
    send_json(listen, json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } })).await;
    send_json(
        listen,
        json!({
            "documentChange": {
                "document": {
                    "name": ROOM_A,
                    "fields": { "topic": { "stringValue": "rust" } },
                    "createTime": "2024-01-01T00:00:01Z",
                    "updateTime": "2024-01-01T00:00:01Z"
                },
                "targetIds": [2]
            }
        }),
    )
    .await;
    send_json(
        listen,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "cjE=" } }),
    )
    .await;
    send_json(listen, global_snapshot("2024-01-01T00:00:02Z")).await;
}

#[tokio::test]
async fn listening_raises_a_synced_snapshot() {
    let (client, backend) = start().await;
    let registration = client.listen(rooms(), ListenOptions::default()).await.unwrap();

    let listen = backend.accept("listen").await;
    sync_room_a(&listen).await;

    let snapshot = next_snapshot(&registration).await;
    assert!(!snapshot.from_cache);
    assert_eq!(snapshot.docs.len(), 1);
    let document = snapshot.docs.first().unwrap();
    assert_eq!(document.key(), &DocumentKey::from_string("rooms/a").unwrap());
    assert_eq!(
        document.data().fields().get("topic"),
        Some(&FirestoreValue::from_string("rust"))
    );
}

#[tokio::test]
async fn listen_retries_a_transient_storage_failure() {
    let persistence = Arc::new(MemoryPersistence::new());
    let (client, backend) = start_with(Arc::clone(&persistence)).await;
    persistence.fail_next_commits(1);

    let registration = client.listen(rooms(), ListenOptions::default()).await.unwrap();
    let listen = backend.accept("listen").await;
    sync_room_a(&listen).await;

    let snapshot = next_snapshot(&registration).await;
    assert_eq!(snapshot.docs.len(), 1);
    assert!(!snapshot.from_cache);
}

#[tokio::test]
async fn writes_resolve_once_the_backend_acknowledges_them() {
    let (client, backend) = start().await;
    let mut fields = BTreeMap::new();
    fields.insert("topic".to_string(), FirestoreValue::from_string("rust"));
    let mutation = Mutation::set(DocumentKey::from_string("rooms/a").unwrap(), MapValue::new(fields));

    let backend_script = async {
        let write = backend.accept("write").await;
        let handshake = recv_json(&write).await;
        assert_eq!(handshake, json!({ "database": "projects/p/databases/(default)" }));
        send_json(&write, json!({ "streamToken": "czE=" })).await;

        let request = recv_json(&write).await;
        assert_eq!(request["writes"].as_array().unwrap().len(), 1);
        assert_eq!(request["writes"][0]["update"]["name"], json!(ROOM_A));
        send_json(
            &write,
            json!({
                "streamToken": "czI=",
                "commitTime": "2024-01-01T00:00:03Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:03Z" }]
            }),
        )
        .await;
        write
    };
    let (result, _write) = tokio::join!(client.write(vec![mutation]), backend_script);
    result.unwrap();
    client.wait_for_pending_writes().await.unwrap();
}

#[tokio::test]
async fn limbo_document_missing_from_the_backend_leaves_the_view() {
    let (client, backend) = start().await;
    let registration = client.listen(rooms(), ListenOptions::default()).await.unwrap();
    let listen = backend.accept("listen").await;
    sync_room_a(&listen).await;
    assert_eq!(next_snapshot(&registration).await.docs.len(), 1);

    // The target drops the document without deleting it.
    send_json(
        &listen,
        json!({ "documentRemove": { "document": ROOM_A, "removedTargetIds": [2] } }),
    )
    .await;
    send_json(&listen, global_snapshot("2024-01-01T00:00:04Z")).await;

    let request = recv_json(&listen).await;
    let limbo_target = &request["addTargets"][0];
    let limbo_target_id = limbo_target["targetId"].as_i64().unwrap();
    assert_eq!(limbo_target_id % 2, 1);
    assert_eq!(limbo_target["documents"]["documents"], json!([ROOM_A]));
    let active = client.sync_engine().active_limbo_document_resolutions().await;
    assert!(active.contains_key(&DocumentKey::from_string("rooms/a").unwrap()));

    // The backend reports the limbo target current without the document.
    send_json(
        &listen,
        json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [limbo_target_id] } }),
    )
    .await;
    send_json(
        &listen,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [limbo_target_id], "resumeToken": "cjI=" } }),
    )
    .await;
    send_json(&listen, global_snapshot("2024-01-01T00:00:05Z")).await;

    let snapshot = next_snapshot(&registration).await;
    assert!(snapshot.docs.is_empty());
    assert!(!snapshot.from_cache);

    let request = recv_json(&listen).await;
    assert_eq!(request["removeTargets"], json!([limbo_target_id]));
    assert!(client.sync_engine().active_limbo_document_resolutions().await.is_empty());
}

#[tokio::test]
async fn cache_only_query_sees_local_writes_while_offline() {
    let (client, _backend) = start().await;
    client.disable_network().await.unwrap();

    let registration = client
        .listen(
            rooms(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
        )
        .await
        .unwrap();
    let initial = next_snapshot(&registration).await;
    assert!(initial.from_cache);
    assert!(initial.docs.is_empty());

    let mut fields = BTreeMap::new();
    fields.insert("topic".to_string(), FirestoreValue::from_string("offline"));
    let mutation = Mutation::set(DocumentKey::from_string("rooms/b").unwrap(), MapValue::new(fields));
    // Offline, the acknowledgement never arrives.
    let write = client.write(vec![mutation]);
    tokio::pin!(write);
    let snapshot = tokio::select! {
        snapshot = next_snapshot(&registration) => snapshot,
        _ = &mut write => panic!("write acknowledged while offline"),
    };
    assert_eq!(snapshot.docs.len(), 1);
    assert!(snapshot.has_pending_writes());

    let cached = client.get_documents_from_local_cache(rooms()).await.unwrap();
    assert_eq!(cached.docs.len(), 1);
    assert!(cached.from_cache);
}
