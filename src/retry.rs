//! Bounded retry with backoff around any asynchronous operation.
//!
//! The combinator owns no state and knows nothing about tasks; both the upload
//! coordinator and the edit-intent resolver drive their network calls through
//! it so there is exactly one implementation of the backoff semantics.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How long to wait after a failed attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Attempt `n` waits `delays_ms[n - 1]`; attempts past the end reuse the
    /// last entry.
    Schedule { delays_ms: Vec<u64> },
    /// `base_ms * 2^(n - 1)`, capped at `max_ms`, plus uniform jitter in
    /// `[0, jitter_ms]`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
}

impl Backoff {
    pub fn schedule(delays: &[Duration]) -> Self {
        Backoff::Schedule {
            delays_ms: delays.iter().map(|d| d.as_millis() as u64).collect(),
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Schedule { delays_ms } => {
                let idx = (attempt as usize - 1).min(delays_ms.len().saturating_sub(1));
                Duration::from_millis(delays_ms.get(idx).copied().unwrap_or(0))
            }
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => {
                let exponent = (attempt - 1).min(16);
                let capped = base_ms.saturating_mul(1u64 << exponent).min(*max_ms);
                let jitter = if *jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=*jitter_ms)
                } else {
                    0
                };
                Duration::from_millis(capped.saturating_add(jitter))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Schedule { delays_ms: vec![] })
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

/// Passed to the retry observer after an attempt fails and before the wait.
#[derive(Debug)]
pub struct RetryNotice<'a, E> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a E,
}

impl<E> RetryNotice<'_, E> {
    pub fn next_attempt(&self) -> u32 {
        self.attempt + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Calls `operation` until it succeeds or the policy's attempts are spent,
/// returning the last error in the latter case.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_notify(policy, operation, |_| RetryDecision::Retry).await
}

/// Like [`retry_with_backoff`], but `on_retry` sees every failure that still
/// has attempts left and may stop the loop early by returning
/// [`RetryDecision::GiveUp`].
pub async fn retry_with_backoff_notify<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: O,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&RetryNotice<'_, E>) -> RetryDecision,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts {
                    debug!(attempt, max_attempts, "retry budget exhausted");
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                let notice = RetryNotice {
                    attempt,
                    max_attempts,
                    delay,
                    error: &error,
                };
                if on_retry(&notice) == RetryDecision::GiveUp {
                    debug!(attempt, "retry abandoned by caller");
                    return Err(error);
                }

                debug!(attempt, delay_ms = delay.as_millis() as u64, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
