//! Bounded retry with a pluggable sleeper

use crate::config::DispatchSection;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay schedule for a bounded number of attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delays after each failed attempt, in order
    pub backoff_pattern: Vec<Duration>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: Duration,
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_pattern: Vec::new(),
            sustained_delay: delay,
        }
    }

    pub fn from_dispatch(dispatch: &DispatchSection) -> Self {
        Self::fixed(dispatch.max_attempts, dispatch.backoff())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_dispatch(&DispatchSection::default())
    }
}

/// Source of delays; tests swap in a recording sleeper
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Value plus the attempt that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// All attempts failed
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `operation` until it succeeds, `policy.max_attempts` is reached, or it
/// fails with an error `retryable` refuses
///
/// The operation receives the 1-based attempt number. No delay follows the
/// final attempt.
pub async fn execute_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    retryable: R,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(operation = label, attempts = attempt, error = %e, "Giving up");
                return Err(RetryError {
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}
