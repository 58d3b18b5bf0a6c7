use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Not yet known: the watch stream is connecting or has not been needed.
    #[default]
    Unknown,
    Online,
    /// Queries are served from cache and flagged as such.
    Offline,
}

/// Watch stream failures tolerated before the client reports itself offline.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync + 'static>;

/// Derives the online state from the health of the watch stream.
///
/// The state starts as [`OnlineState::Unknown`]. It becomes `Offline` after
/// [`MAX_WATCH_STREAM_FAILURES`] consecutive connection failures or when the
/// backend does not answer within the configured timeout, and `Online` once
/// a watch message arrives. Every change is reported to the handler.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    online_state_timeout: Duration,
    should_warn_client_is_offline: bool,
    handler: OnlineStateHandler,
}

impl OnlineStateTracker {
    pub fn new(online_state_timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            online_state_timeout,
            should_warn_client_is_offline: true,
            handler,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream starts connecting. `on_timeout` is
    /// queued if the backend stays silent for too long and must call
    /// [`OnlineStateTracker::handle_online_state_timeout`].
    pub fn handle_watch_stream_start<F, Fut>(&mut self, queue: &AsyncQueue, on_timeout: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.watch_stream_failures != 0 {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown);
        self.clear_online_state_timer();
        self.online_state_timer = Some(queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.online_state_timeout,
            on_timeout,
        ));
    }

    pub fn handle_online_state_timeout(&mut self) {
        let Some(timer) = self.online_state_timer.take() else {
            return;
        };
        if timer.is_cancelled() {
            return;
        }
        if self.state == OnlineState::Unknown {
            self.log_offline_warning_if_necessary(&format!(
                "Backend didn't respond within {} seconds.",
                self.online_state_timeout.as_secs()
            ));
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) {
        if self.state == OnlineState::Online {
            // A stream that was healthy may just need to reconnect.
            self.set_and_broadcast(OnlineState::Unknown);
            return;
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_online_state_timer();
            self.log_offline_warning_if_necessary(&format!(
                "Connection failed {} times. Most recent error: {error}",
                MAX_WATCH_STREAM_FAILURES
            ));
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    /// Explicitly sets the state, e.g. `Online` after a watch message or
    /// `Offline` when the network is disabled.
    pub fn set(&mut self, state: OnlineState) {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state);
    }

    fn set_and_broadcast(&mut self, state: OnlineState) {
        if state != self.state {
            log::debug!("online state changed from {:?} to {:?}", self.state, state);
            self.state = state;
            (self.handler)(state);
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }

    fn log_offline_warning_if_necessary(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can reach the backend."
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}
