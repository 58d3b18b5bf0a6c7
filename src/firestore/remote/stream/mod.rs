//! Framed transports and the logical streams multiplexed over them.
//!
//! A [`StreamTransport`] moves [`TransportFrame`]s between two peers. A
//! [`MultiplexedConnection`] on each side turns that into any number of
//! independent bidirectional streams: the client opens them, the server side
//! accepts them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

mod listen;
mod persistent;
#[cfg(feature = "websocket")]
mod websocket;
mod write;

pub use listen::WatchStream;
pub use persistent::{PersistentStream, StreamEvent, StreamEventSink, StreamKind, StreamState};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
pub use write::WriteStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// First frame of a stream. Names the logical channel (`listen` or
    /// `write`) and carries the caller's bearer token, if any.
    Open {
        channel: String,
        auth_token: Option<String>,
    },
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn new(stream_id: StreamId, kind: FrameKind) -> Self {
        Self { stream_id, kind }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self::new(stream_id, FrameKind::Data(payload))
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameKind::Close)
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self::new(stream_id, FrameKind::Error(error))
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

/// One open logical stream as seen by the remote store.
#[async_trait]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()>;
    /// `None` once the peer closed the stream.
    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>>;
    async fn close(&self) -> FirestoreResult<()>;
}

/// Opens logical streams to the backend.
#[async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    async fn open(
        &self,
        channel: &str,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_registry(streams: &StreamRegistry) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A stream opened by the peer, as returned by
/// [`MultiplexedConnection::accept`].
pub struct AcceptedStream {
    pub channel: String,
    pub auth_token: Option<String>,
    pub stream: MultiplexedStream,
}

pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted: Receiver<AcceptedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(
            transport,
            Arc::clone(&streams),
            outbound_tx.clone(),
            accepted_tx,
        );
        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted: accepted_rx,
        }
    }

    pub async fn open_stream(
        &self,
        channel: &str,
        auth_token: Option<String>,
    ) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_registry(&self.streams).insert(stream_id, inbound_tx);
        let open = FrameKind::Open {
            channel: channel.to_string(),
            auth_token,
        };
        self.outbound_tx
            .send(TransportFrame::new(stream_id, open))
            .await
            .map_err(|err| unavailable(format!("connection closed before open: {err}")))?;
        Ok(MultiplexedStream::new(
            stream_id,
            self.outbound_tx.clone(),
            inbound_rx,
            Arc::clone(&self.streams),
        ))
    }

    /// Waits for the peer to open a stream. `None` once the transport is
    /// gone.
    pub async fn accept(&self) -> Option<AcceptedStream> {
        self.accepted.recv().await.ok()
    }
}

#[async_trait]
impl StreamConnection for MultiplexedConnection {
    async fn open(
        &self,
        channel: &str,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let stream = self.open_stream(channel, auth_token).await?;
        Ok(Arc::new(stream))
    }
}

fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::warn!("multiplexed outbound loop terminated: {err}");
                break;
            }
        }
    });
}

fn start_inbound_loop(
    transport: Arc<dyn StreamTransport>,
    streams: StreamRegistry,
    outbound_tx: Sender<TransportFrame>,
    accepted_tx: Sender<AcceptedStream>,
) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("multiplexed inbound loop terminated: {err}");
                    break;
                }
            };
            let stream_id = frame.stream_id();
            let sender = lock_registry(&streams).get(&stream_id).cloned();
            match (sender, frame.into_kind()) {
                (None, FrameKind::Open { channel, auth_token }) => {
                    let (inbound_tx, inbound_rx) = async_channel::unbounded();
                    lock_registry(&streams).insert(stream_id, inbound_tx);
                    let stream = MultiplexedStream::new(
                        stream_id,
                        outbound_tx.clone(),
                        inbound_rx,
                        Arc::clone(&streams),
                    );
                    let accepted = AcceptedStream {
                        channel,
                        auth_token,
                        stream,
                    };
                    if accepted_tx.send(accepted).await.is_err() {
                        log::debug!("no acceptor for stream {}", stream_id.value());
                    }
                }
                (None, _) => {
                    log::debug!("dropping frame for unknown stream {}", stream_id.value());
                }
                (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                    let _ = sender.send(event).await;
                    lock_registry(&streams).remove(&stream_id);
                }
                (Some(sender), event) => {
                    if sender.send(event).await.is_err() {
                        log::debug!("dropping inbound frame for closed stream {}", stream_id.value());
                    }
                }
            }
        }

        // Every stream still open learns that the connection is gone.
        let orphaned: Vec<_> = lock_registry(&streams).drain().collect();
        for (_, sender) in orphaned {
            let _ = sender
                .send(FrameKind::Error(unavailable("connection to the backend was lost")))
                .await;
        }
        accepted_tx.close();
    });
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamRegistry,
}

impl MultiplexedStream {
    fn new(
        id: StreamId,
        outbound: Sender<TransportFrame>,
        inbound: Receiver<FrameKind>,
        streams: StreamRegistry,
    ) -> Self {
        Self {
            id,
            outbound,
            inbound,
            streams,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Fails the stream on the peer's side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock_registry(&self.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue error frame: {err}")))
    }

    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open { .. } => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        let registered = lock_registry(&self.streams).remove(&self.id).is_some();
        if !registered {
            return Ok(());
        }
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if lock_registry(&self.streams).remove(&self.id).is_some() {
            let _ = self.outbound.try_send(TransportFrame::close(self.id));
        }
    }
}

#[async_trait]
impl StreamHandle for MultiplexedStream {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        MultiplexedStream::send(self, payload).await
    }

    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        MultiplexedStream::next(self).await
    }

    async fn close(&self) -> FirestoreResult<()> {
        MultiplexedStream::close(self).await
    }
}

/// Two transports wired back to back, for tests and in-process backends.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Drops the link in both directions.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepted_stream_exchanges_payloads() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(client_transport);
        let server = MultiplexedConnection::new(server_transport);

        let stream = client
            .open_stream("listen", Some("token".to_string()))
            .await
            .expect("open stream");
        let accepted = server.accept().await.expect("accepted stream");
        assert_eq!(accepted.channel, "listen");
        assert_eq!(accepted.auth_token.as_deref(), Some("token"));

        stream.send(b"hello".to_vec()).await.expect("client send");
        let payload = accepted.stream.next().await.expect("frame").expect("payload");
        assert_eq!(payload, b"hello");

        accepted.stream.send(b"world".to_vec()).await.expect("server send");
        let payload = stream.next().await.expect("frame").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(client_transport);
        let server = MultiplexedConnection::new(server_transport);

        let stream = client.open_stream("write", None).await.expect("open stream");
        let accepted = server.accept().await.expect("accepted stream");
        stream.close().await.expect("close");
        assert!(accepted.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_stream_surfaces_error_code() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(client_transport);
        let server = MultiplexedConnection::new(server_transport);

        let stream = client.open_stream("write", None).await.expect("open stream");
        let accepted = server.accept().await.expect("accepted stream");
        accepted
            .stream
            .fail(crate::firestore::error::permission_denied("denied"))
            .await
            .expect("fail");
        let err = stream.next().await.expect("frame").unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn lost_transport_fails_open_streams() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(Arc::clone(&client_transport) as Arc<dyn StreamTransport>);
        let _server = MultiplexedConnection::new(server_transport);

        let stream = client.open_stream("listen", None).await.expect("open stream");
        client_transport.disconnect();
        let err = stream.next().await.expect("frame").unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Unavailable);
    }
}
