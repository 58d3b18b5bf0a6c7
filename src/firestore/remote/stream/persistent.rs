//! The connection state machine shared by the listen and write streams.
//!
//! A [`PersistentStream`] never touches the network from the async queue.
//! Opening a stream, waiting for credentials and reading messages happen on a
//! background task; every outcome is handed back as a [`StreamEvent`] which
//! the [`StreamEventSink`] processes on the queue. Each event carries the
//! generation it was produced for, so events from a stream that has since
//! been closed or restarted are recognized as stale and dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::credentials::CredentialsProviderArc;
use crate::firestore::remote::stream::{StreamConnection, StreamHandle};
use crate::firestore::settings::BackoffSettings;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn channel(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }

    fn idle_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Starting
///                          \-> Closing -> Initial
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or cleanly stopped. `start` opens immediately.
    Initial,
    /// Fetching credentials and opening the underlying stream.
    Starting,
    Open,
    /// Failed. The next `start` waits for the backoff delay.
    Error,
    /// Waiting for the backoff timer before reconnecting.
    Backoff,
    /// Tearing down; only observable while `close` runs.
    Closing,
}

pub enum StreamEvent {
    Opened(Arc<dyn StreamHandle>),
    Message(Vec<u8>),
    /// The underlying stream ended, with the error that ended it.
    Closed(Option<FirestoreError>),
    BackoffElapsed,
    IdleTimeout,
}

impl std::fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEvent::Opened(_) => write!(f, "Opened"),
            StreamEvent::Message(payload) => write!(f, "Message({} bytes)", payload.len()),
            StreamEvent::Closed(error) => write!(f, "Closed({error:?})"),
            StreamEvent::BackoffElapsed => write!(f, "BackoffElapsed"),
            StreamEvent::IdleTimeout => write!(f, "IdleTimeout"),
        }
    }
}

/// Receives stream events on the async queue.
pub trait StreamEventSink: Send + Sync + 'static {
    fn dispatch(
        &self,
        kind: StreamKind,
        generation: u64,
        event: StreamEvent,
    ) -> BoxFuture<'static, FirestoreResult<()>>;
}

/// Queues events for one generation of one stream.
#[derive(Clone)]
struct EventDispatcher {
    kind: StreamKind,
    generation: u64,
    queue: AsyncQueue,
    sink: Arc<dyn StreamEventSink>,
}

impl EventDispatcher {
    fn dispatch(&self, event: StreamEvent) {
        let sink = Arc::clone(&self.sink);
        let (kind, generation) = (self.kind, self.generation);
        self.queue
            .enqueue_and_forget(move || sink.dispatch(kind, generation, event));
    }
}

pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    idle_timeout: Duration,
    queue: AsyncQueue,
    connection: Arc<dyn StreamConnection>,
    credentials: CredentialsProviderArc,
    sink: Arc<dyn StreamEventSink>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        connection: Arc<dyn StreamConnection>,
        credentials: CredentialsProviderArc,
        sink: Arc<dyn StreamEventSink>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            handle: None,
            backoff: ExponentialBackoff::new(backoff),
            idle_timer: None,
            idle_timeout,
            queue,
            connection,
            credentials,
            sink,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `start` was called and the stream has not been stopped or
    /// failed since.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Connects, after the backoff delay if the previous attempt failed.
    pub fn start(&mut self) {
        match self.state {
            StreamState::Error => self.perform_backoff(),
            StreamState::Initial => self.open(),
            state => log::debug!("{:?} stream already started ({state:?})", self.kind),
        }
    }

    /// Closes the stream without treating it as a failure.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Initial, None);
        }
    }

    /// After a failure, lets the next `start` connect without waiting.
    pub fn inhibit_backoff(&mut self) {
        if self.is_started() {
            log::error!("inhibit_backoff called on a started {:?} stream", self.kind);
            return;
        }
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    /// Starts the idle timer unless one is already running. An idle stream
    /// that sees no traffic before it fires is closed.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            let dispatcher = self.dispatcher();
            self.idle_timer = Some(self.queue.enqueue_after_delay(
                self.kind.idle_timer(),
                self.idle_timeout,
                move || async move {
                    dispatcher.dispatch(StreamEvent::IdleTimeout);
                    Ok(())
                },
            ));
        }
    }

    pub async fn send(&mut self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.cancel_idle_check();
        match &self.handle {
            Some(handle) => handle.send(payload).await,
            None => {
                log::debug!("dropping message for {:?} stream that is not open", self.kind);
                Ok(())
            }
        }
    }

    /// Whether an event produced for `generation` still applies.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Marks the stream open. Returns `false` for a stale open, whose handle
    /// is closed again.
    pub fn handle_opened(&mut self, generation: u64, handle: Arc<dyn StreamHandle>) -> bool {
        if !self.is_current(generation) || self.state != StreamState::Starting {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
            return false;
        }
        log::debug!("{:?} stream opened", self.kind);
        self.handle = Some(handle);
        self.state = StreamState::Open;
        true
    }

    /// A message arrived. Any traffic proves the connection healthy.
    pub fn handle_message(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || !self.is_open() {
            return false;
        }
        self.backoff.reset();
        true
    }

    /// The peer ended the stream. A stream never closes cleanly on its own,
    /// so this always counts as a failure.
    pub fn handle_closed(&mut self, generation: u64, error: Option<FirestoreError>) -> bool {
        if !self.is_current(generation) || !self.is_started() {
            return false;
        }
        log::debug!("{:?} stream closed: {error:?}", self.kind);
        self.close(StreamState::Error, error.as_ref());
        true
    }

    pub fn handle_backoff_elapsed(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != StreamState::Backoff {
            return false;
        }
        self.state = StreamState::Initial;
        self.open();
        true
    }

    /// Closes an open stream whose idle timer fired.
    pub fn handle_idle_timeout(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || !self.is_open() {
            return false;
        }
        self.idle_timer = None;
        log::debug!("closing idle {:?} stream", self.kind);
        self.close(StreamState::Initial, None);
        true
    }

    fn open(&mut self) {
        self.generation += 1;
        self.state = StreamState::Starting;
        let dispatcher = self.dispatcher();
        let credentials = Arc::clone(&self.credentials);
        let connection = Arc::clone(&self.connection);
        let channel = self.kind.channel();

        runtime::spawn_detached(async move {
            let token = match credentials.get_token().await {
                Ok(token) => token.map(|token| token.value),
                Err(err) => {
                    dispatcher.dispatch(StreamEvent::Closed(Some(err)));
                    return;
                }
            };
            let handle = match connection.open(channel, token).await {
                Ok(handle) => handle,
                Err(err) => {
                    dispatcher.dispatch(StreamEvent::Closed(Some(err)));
                    return;
                }
            };
            dispatcher.dispatch(StreamEvent::Opened(Arc::clone(&handle)));
            while let Some(message) = handle.next().await {
                match message {
                    Ok(payload) => dispatcher.dispatch(StreamEvent::Message(payload)),
                    Err(err) => {
                        dispatcher.dispatch(StreamEvent::Closed(Some(err)));
                        return;
                    }
                }
            }
            dispatcher.dispatch(StreamEvent::Closed(None));
        });
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let dispatcher = self.dispatcher();
        self.backoff
            .backoff_and_run(&self.queue, self.kind.backoff_timer(), move || async move {
                dispatcher.dispatch(StreamEvent::BackoffElapsed);
                Ok(())
            });
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>) {
        self.state = StreamState::Closing;
        self.cancel_idle_check();
        self.backoff.cancel();
        // Everything still in flight for the old generation becomes stale.
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = error {
            match error.code {
                FirestoreErrorCode::ResourceExhausted => {
                    log::error!("{:?} stream exhausted a backend resource: {error}", self.kind);
                    self.backoff.reset_to_max();
                }
                FirestoreErrorCode::Unauthenticated => {
                    log::debug!("{:?} stream rejected the credentials, refreshing token", self.kind);
                    self.credentials.invalidate_token();
                }
                _ => {}
            }
        }

        if let Some(handle) = self.handle.take() {
            runtime::spawn_detached(async move {
                if let Err(err) = handle.close().await {
                    log::debug!("closing stream failed: {err}");
                }
            });
        }
        self.state = final_state;
    }

    fn cancel_idle_check(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher {
            kind: self.kind,
            generation: self.generation,
            queue: self.queue.clone(),
            sink: Arc::clone(&self.sink),
        }
    }
}
