//! Single-consumer FIFO task queue.
//!
//! Every operation that mutates local store or sync engine state is enqueued
//! here and executed by one worker task, strictly in enqueue order. An
//! operation that awaits I/O keeps the queue blocked until it completes, so a
//! later operation never observes a half-applied earlier one.
//!
//! Operations running on the queue must never enqueue another operation and
//! wait for it; that would deadlock the worker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::settings::{BackoffSettings, DEFAULT_MAX_STORAGE_RETRIES};
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

type QueuedOperation = BoxFuture<'static, ()>;

/// Identifies the purpose of a delayed operation, mostly for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
}

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: Sender<QueuedOperation>,
    shutting_down: AtomicBool,
    max_storage_retries: u32,
    retry_backoff: BackoffSettings,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_policy(DEFAULT_MAX_STORAGE_RETRIES, BackoffSettings::default())
    }

    /// Creates a queue whose retryable operations are re-run at most
    /// `max_storage_retries` times after a transient storage failure.
    pub fn with_retry_policy(max_storage_retries: u32, retry_backoff: BackoffSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(run_worker(receiver));
        Self {
            inner: Arc::new(QueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                max_storage_retries,
                retry_backoff,
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Appends `operation` to the queue and returns a future resolving to its
    /// result. The operation is queued when this method is called, not when
    /// the returned future is first polled.
    pub fn enqueue<F, Fut, T>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = operation().await;
            let _ = tx.send(result);
        }
        .boxed();
        let queued = self.push(job);
        async move {
            queued?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(cancelled("The operation was dropped by the async queue")),
            }
        }
    }

    /// Queues an operation whose failure is only logged.
    pub fn enqueue_and_forget<F, Fut>(&self, operation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let job = async move {
            if let Err(err) = operation().await {
                log::warn!("async queue operation failed: {err}");
            }
        }
        .boxed();
        if let Err(err) = self.push(job) {
            log::debug!("dropping operation enqueued after shutdown: {err}");
        }
    }

    /// Queues an operation that is re-run in place when it fails with a
    /// transient storage error. Retries happen inside the same queue slot so
    /// later operations still wait for it.
    pub fn enqueue_retryable<F, Fut, T>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let max_retries = self.inner.max_storage_retries;
        let settings = self.inner.retry_backoff.clone();
        self.enqueue(move || async move {
            let mut backoff = ExponentialBackoff::new(settings);
            let mut attempt = 0u32;
            loop {
                match operation().await {
                    Err(err) if err.is_transient_storage() && attempt < max_retries => {
                        attempt += 1;
                        let delay = backoff.next_delay();
                        log::debug!(
                            "retrying operation after transient storage failure (attempt {attempt}): {err}"
                        );
                        runtime::sleep(delay).await;
                    }
                    other => return other,
                }
            }
        })
    }

    /// Runs `operation` on the queue once `delay` has elapsed unless the
    /// returned handle is cancelled first.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let queue = self.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            queue.enqueue_and_forget(move || async move {
                if flag.load(Ordering::SeqCst) {
                    return Ok(());
                }
                operation().await
            });
        });
        DelayedOperation { timer_id, cancelled }
    }

    /// Queues a final operation and rejects everything enqueued after it.
    /// Operations queued earlier still run to completion first.
    pub fn enqueue_and_initiate_shutdown<F, Fut>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<()>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let result = self.enqueue(move || async move {
            let outcome = operation().await;
            inner.sender.close();
            outcome
        });
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        result
    }

    fn push(&self, job: QueuedOperation) -> FirestoreResult<()> {
        if self.is_shutting_down() {
            return Err(cancelled("The client has already been shut down"));
        }
        self.inner
            .sender
            .try_send(job)
            .map_err(|_| cancelled("The async queue is closed"))
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(receiver: Receiver<QueuedOperation>) {
    while let Ok(job) = receiver.recv().await {
        job.await;
    }
    log::debug!("async queue worker stopped");
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreErrorCode};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn fast_retry_queue(retries: u32) -> AsyncQueue {
        AsyncQueue::with_retry_policy(
            retries,
            BackoffSettings {
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(1),
                jitter_factor: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&log);
        let first = queue.enqueue(move || async move {
            runtime::sleep(Duration::from_millis(20)).await;
            first_log.lock().unwrap().push(1);
            Ok(())
        });
        let second_log = Arc::clone(&log);
        let second = queue.enqueue(move || async move {
            second_log.lock().unwrap().push(2);
            Ok(())
        });

        second.await.unwrap();
        first.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn returns_operation_errors() {
        let queue = AsyncQueue::new();
        let err = queue
            .enqueue(|| async { Err::<(), _>(invalid_argument("bad input")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn retries_transient_storage_failures() {
        let queue = fast_retry_queue(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let value = queue
            .enqueue_retryable(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FirestoreError::transient_storage("locked"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let queue = fast_retry_queue(1);
        let err = queue
            .enqueue_retryable(|| async {
                Err::<(), _>(FirestoreError::transient_storage("still locked"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient_storage());
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let delayed = queue.enqueue_after_delay(
            TimerId::WriteStreamIdle,
            Duration::from_millis(10),
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        delayed.cancel();
        runtime::sleep(Duration::from_millis(40)).await;
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delayed_operation_runs_after_delay() {
        let queue = AsyncQueue::new();
        let (tx, rx) = oneshot::channel();
        queue.enqueue_after_delay(
            TimerId::ListenStreamIdle,
            Duration::from_millis(5),
            move || async move {
                let _ = tx.send(());
                Ok(())
            },
        );
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_later_operations() {
        let queue = AsyncQueue::new();
        let earlier = queue.enqueue(|| async { Ok(1) });
        let shutdown = queue.enqueue_and_initiate_shutdown(|| async { Ok(()) });
        let later = queue.enqueue(|| async { Ok(2) });

        assert_eq!(earlier.await.unwrap(), 1);
        shutdown.await.unwrap();
        assert_eq!(later.await.unwrap_err().code, FirestoreErrorCode::Cancelled);
        assert!(queue.is_shutting_down());
    }
}
