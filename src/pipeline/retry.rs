//! Bounded retry with exponential backoff for any fallible async operation.
//!
//! Contract synthesis, extraction dispatch and summary generation all go
//! through [`RetryPolicy::run`]. Each call gets its own attempt counter and
//! backoff timer, so concurrent documents never share retry state.
//!
//! ## Schedule
//!
//! The wait before attempt `k + 1` is `base_delay * multiplier^(k - 1)`,
//! capped at `max_delay`. With the defaults (500 ms, ×2, 30 s cap, 3
//! attempts) the sequence is 500 ms → 1 s, under 2 s of backoff per call.
//! A server-provided retry-after hint raises the wait, never lowers it, and
//! is itself capped at `max_delay`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Give up now and surface the error.
    Stop,
    /// Retry after the scheduled backoff.
    Retry,
    /// Retry, waiting at least this long.
    RetryAfter(Duration),
}

impl Decision {
    /// Classification used for every model call.
    pub fn for_dispatch(err: &DispatchError) -> Self {
        match (err.is_retryable(), err.retry_after_secs()) {
            (false, _) => Decision::Stop,
            (true, Some(secs)) => Decision::RetryAfter(Duration::from_secs(secs)),
            (true, None) => Decision::Retry,
        }
    }
}

/// Exponential backoff schedule plus attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Default: 3.
    pub max_attempts: u32,
    /// Wait before the first retry. Default: 500 ms.
    pub base_delay: Duration,
    /// Growth factor per retry. Default: 2.0.
    pub multiplier: f64,
    /// Upper bound on any single wait. Default: 30 s.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried operation ultimately failed.
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error classified as permanent.
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent { attempts: u32, error: E },

    /// The cancellation token fired before the next attempt.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E: fmt::Display> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last error seen, if any attempt was made.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1 = the wait after the first failure).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Wait after failed attempt `attempt`, honouring a retry-after hint up
    /// to `max_delay`.
    pub fn backoff_for(&self, attempt: u32, decision: Decision) -> Duration {
        let backoff = self.delay_for(attempt);
        match decision {
            Decision::RetryAfter(hint) => backoff.max(hint.min(self.max_delay)),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, `classify` says stop, attempts run out,
    /// or `cancel` fires.
    ///
    /// Cancellation is checked before every attempt and preempts the backoff
    /// wait; an attempt already in flight is allowed to finish.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Decision,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last: Option<E> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                    last,
                });
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempts = attempt, "succeeded after retries");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    let decision = classify(&e);
                    if decision == Decision::Stop {
                        warn!(operation, attempt, error = %e, "permanent failure, not retrying");
                        return Err(RetryError::Permanent {
                            attempts: attempt,
                            error: e,
                        });
                    }
                    if attempt == max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "failed after max attempts");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }

                    let backoff = self.backoff_for(attempt, decision);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    last = Some(e);

                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt, last });
                        }
                    }
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        Err(RetryError::Cancelled {
            attempts: max_attempts,
            last,
        })
    }
}
