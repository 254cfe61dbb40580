//! Convergence waiting
//!
//! Every blocking wait in a transition is a fixed-interval poll of external state:
//!
//! ```text
//! check() ──► done? ──yes──► return
//!               │
//!               no ── log progress ── sleep(interval) ── check() ...
//! ```
//!
//! [`poll_until`] loops until the predicate holds. [`poll_until_deadline`] races the
//! same loop against a timer; when the timer wins the polling future is dropped,
//! so nothing keeps querying the provider after the deadline.

use crate::error::{PauseError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Default interval between convergence checks
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;

/// Outcome of one convergence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Condition holds, stop polling
    pub done: bool,
    /// Human-readable progress, e.g. "3/5 nodes ready"
    pub detail: String,
}

impl Progress {
    /// The condition holds
    pub fn done(detail: impl Into<String>) -> Self {
        Self {
            done: true,
            detail: detail.into(),
        }
    }

    /// The condition does not hold yet
    pub fn pending(detail: impl Into<String>) -> Self {
        Self {
            done: false,
            detail: detail.into(),
        }
    }

    /// Build from a count against a target
    pub fn count(current: usize, target: usize, what: &str) -> Self {
        let detail = format!("{}/{} {}", current, target, what);
        if current >= target {
            Self::done(detail)
        } else {
            Self::pending(detail)
        }
    }
}

/// Poll `check` every `interval` until it reports done.
///
/// Errors returned by `check` abort the wait. There is no deadline; callers that
/// need one use [`poll_until_deadline`].
pub async fn poll_until<F, Fut>(what: &str, interval: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress>>,
{
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let progress = check().await?;

        if progress.done {
            info!(what, attempt, detail = %progress.detail, "Converged");
            return Ok(());
        }

        info!(what, attempt, detail = %progress.detail, "Waiting");
        tokio::time::sleep(interval).await;
    }
}

/// Poll `check` every `interval`, failing with [`PauseError::Timeout`] after `deadline`.
pub async fn poll_until_deadline<F, Fut>(
    what: &str,
    interval: Duration,
    deadline: Duration,
    check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress>>,
{
    debug!(what, deadline_secs = deadline.as_secs(), "Polling with deadline");

    match tokio::time::timeout(deadline, poll_until(what, interval, check)).await {
        Ok(result) => result,
        Err(_) => Err(PauseError::Timeout(deadline)),
    }
}

/// Sleep through a fixed grace window, logging the minutes left.
///
/// Used where no observable condition exists yet; the window is split into
/// `steps` equal slices so operators see the countdown.
pub async fn grace_window(reason: &str, window: Duration, steps: u32) {
    if window.is_zero() || steps == 0 {
        return;
    }

    let slice = window / steps;
    for remaining in (1..=steps).rev() {
        info!(
            remaining_secs = (slice * remaining).as_secs(),
            "Waiting before {}", reason
        );
        tokio::time::sleep(slice).await;
    }
}
