//! Bounded retry with a compensating action
//!
//! Bulk mutations across a fleet are not atomic. A failed attempt may leave some
//! members mutated and others not, so every retryable bulk operation names a
//! compensation that puts the fleet back into a consistent state before the next
//! attempt.

use crate::error::{PauseError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-backoff retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Create a retry policy
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// Result of an exhausted retry budget
#[derive(Debug)]
pub struct Exhausted {
    /// Attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last_error: PauseError,
}

/// Run `op` until it succeeds, calling `compensate` after each retryable failure.
///
/// Errors for which `should_retry` returns false are returned immediately, without
/// compensation. Every retryable failure is compensated, the final one included.
/// A failing compensation is logged and does not stop the retry loop.
pub async fn retry_with_compensation<T, Op, OpFut, Comp, CompFut, P>(
    what: &str,
    policy: RetryPolicy,
    should_retry: P,
    mut op: Op,
    mut compensate: Comp,
) -> std::result::Result<T, Exhausted>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T>>,
    Comp: FnMut() -> CompFut,
    CompFut: Future<Output = Result<()>>,
    P: Fn(&PauseError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        warn!(
            what,
            attempt,
            max_attempts = policy.attempts,
            error = %err,
            "Attempt failed, compensating"
        );

        if let Err(comp_err) = compensate().await {
            warn!(what, error = %comp_err, "Compensation failed");
        }

        if attempt >= policy.attempts {
            return Err(Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        tokio::time::sleep(policy.backoff).await;
    }
}

/// Retry `op` with no compensation, only for errors marked retryable
pub async fn retry_transient<T, Op, OpFut>(what: &str, policy: RetryPolicy, op: Op) -> Result<T>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T>>,
{
    retry_with_compensation(what, policy, PauseError::is_retryable, op, || async { Ok(()) })
        .await
        .map_err(|exhausted| exhausted.last_error)
}
