//! Bounded polling with an injectable sleep.
//!
//! Every "check, sleep, check again, give up after N" loop in the
//! pipeline goes through [`poll_bounded`]. The sleep is a trait so tests
//! can run the loops without touching the wall clock.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Source of delays between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real sleep on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Never sleeps; remembers what it was asked to sleep for.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Attempt budget for one polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep between consecutive attempts.
    pub delay: Duration,
    /// Sleep before the first attempt.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Longest time a loop under this policy can spend sleeping.
    pub fn worst_case(&self) -> Duration {
        self.initial_delay + self.delay * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(8, Duration::from_secs(15))
    }
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// How a polling loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Run `probe` until it reports [`Poll::Ready`], fails, or the policy's
/// attempts run out.
///
/// `probe` receives the 1-based attempt number. An `Err` from the probe
/// ends the loop immediately; transient faults must be mapped to
/// [`Poll::Pending`] by the caller. There is no sleep after the last attempt.
pub async fn poll_bounded<S, T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &S,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    S: Sleeper,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    if !policy.initial_delay.is_zero() {
        sleeper.sleep(policy.initial_delay).await;
    }

    for attempt in 1..=policy.max_attempts {
        if let Poll::Ready(value) = probe(attempt).await? {
            return Ok(PollOutcome::Ready {
                value,
                attempts: attempt,
            });
        }
        if attempt < policy.max_attempts {
            sleeper.sleep(policy.delay).await;
        }
    }

    Ok(PollOutcome::Exhausted {
        attempts: policy.max_attempts,
    })
}
