//! Retry policy shared by the bridge and the shutdown coordinator

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt can succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(1000))
    }
}

/// Outcome of a retried operation with the number of attempts used
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Attempted<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or attempts run out.
    /// The last error is surfaced on exhaustion.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Attempted<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after error: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
