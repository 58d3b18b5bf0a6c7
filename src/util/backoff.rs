use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::firestore::error::FirestoreResult;
use crate::firestore::settings::BackoffSettings;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Exponential backoff with jitter.
///
/// The first attempt after a reset runs immediately. Every later attempt waits
/// for the current base delay (plus jitter) and then grows the base by the
/// configured factor, clamped to `[initial_delay, max_delay]`.
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: f64,
    last_attempt: Option<Instant>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base_millis: 0.0,
            last_attempt: None,
            timer: None,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// The next attempt waits the maximum delay. Used after
    /// `ResourceExhausted`.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = duration_millis(self.settings.max_delay);
    }

    pub fn current_base(&self) -> Duration {
        Duration::from_millis(self.current_base_millis.round() as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base_millis;
        let jitter = self.settings.jitter_factor * base * rng.gen_range(-1.0..=1.0);
        let desired = (base + jitter).max(0.0);

        let elapsed = self
            .last_attempt
            .map(|instant| duration_millis(instant.elapsed()))
            .unwrap_or(0.0);
        let remaining = (desired - elapsed).max(0.0);

        let initial = duration_millis(self.settings.initial_delay);
        let max = duration_millis(self.settings.max_delay);
        self.current_base_millis = (base * self.settings.backoff_factor).clamp(initial, max.max(initial));

        let delay = Duration::from_millis(remaining.round() as u64);
        self.last_attempt = Some(Instant::now() + delay);
        delay
    }

    /// Schedules `operation` on the queue after the next backoff delay,
    /// replacing any attempt that is still pending.
    pub fn backoff_and_run<F, Fut>(&mut self, queue: &AsyncQueue, timer_id: TimerId, operation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        self.cancel();
        let delay = self.next_delay();
        if !delay.is_zero() {
            log::debug!(
                "backing off {:?}: waiting {} ms (base delay {} ms)",
                timer_id,
                delay.as_millis(),
                self.current_base().as_millis()
            );
        }
        self.timer = Some(queue.enqueue_after_delay(timer_id, delay, operation));
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

fn duration_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}
