//! Bounded retry with exponential backoff and jitter.
//!
//! The helper owns the retry loop shape used at every failure boundary in
//! the daemon: classify the error, back off with jitter, give up after a
//! fixed number of attempts, bail out instantly on cancellation. The sleep
//! primitive is injected so tests can run the whole loop without waiting.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Backoff shape. Defaults match the per-camera apply policy: 10s initial,
/// doubling, capped at 10 minutes, ±20% jitter, 8 attempts per cycle.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(10),
            factor: 2.0,
            max: Duration::from_secs(600),
            jitter: 0.2,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the (0-based) `attempt`-th failure, with `jitter_unit`
    /// in [-1, 1] selecting the point inside the jitter band. Split out
    /// from the rng so tests are exact.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let base = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = base.min(self.max.as_secs_f64());
        let scaled = capped * (1.0 + self.jitter * jitter_unit.clamp(-1.0, 1.0));
        Duration::from_secs_f64(scaled.max(0.0))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, unit)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Classified non-retriable on some attempt.
    Permanent(E),
    /// Retriable every time, but the attempt budget ran out.
    Exhausted(E),
    /// Cancellation fired while backing off.
    Cancelled,
}

/// Run `operation` until it succeeds, is classified permanent, exhausts
/// the policy, or the token cancels. `operation` receives the 1-based
/// attempt number; `classify` returns whether an error is retriable.
pub async fn retry<T, E, Op, Fut, Classify, Sleep, SleepFut>(
    mut operation: Op,
    classify: Classify,
    policy: &BackoffPolicy,
    sleep: Sleep,
    cancel: &CancellationToken,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: Fn(&E) -> bool,
    Sleep: Fn(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !classify(&error) => return Err(RetryError::Permanent(error)),
            Err(error) if attempt == attempts => return Err(RetryError::Exhausted(error)),
            Err(_) => {
                let delay = policy.delay(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
    unreachable!("loop returns on the final attempt")
}
