//! Deadline-bounded polling.
//!
//! Every wait in the orchestration layer has the same shape: fetch, test a
//! terminal predicate, sleep a fixed interval, give up at a deadline.
//! [`poll_until`] owns that loop so callers only supply the fetch and the
//! predicate. Time comes from tokio's clock, which tests pause and advance.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Interval and overall budget for one wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Pause between unsuccessful attempts.
    pub interval: Duration,
    /// Total time allowed before the wait is abandoned.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Outcome of a wait that did not reach its terminal state.
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// The deadline passed before the predicate held.
    #[error("gave up after {attempts} attempts over {waited:?}")]
    Timeout {
        /// Time spent waiting.
        waited: Duration,
        /// Number of fetches performed.
        attempts: u32,
    },
    /// A fetch failed; polling stops immediately.
    #[error("poll attempt failed: {0}")]
    Fetch(#[source] E),
}

/// Repeatedly calls `fetch` until `done` accepts a value or the policy's
/// timeout elapses.
///
/// The first fetch happens immediately. After each rejected value the loop
/// checks the deadline and then sleeps for `policy.interval`, so it never
/// spins and always terminates once the deadline has passed. A timeout too
/// large to represent as an instant means the wait has no deadline.
///
/// # Errors
///
/// Returns [`PollError::Fetch`] on the first failed fetch and
/// [`PollError::Timeout`] once the deadline passes.
pub async fn poll_until<T, E, F, Fut, P>(
    policy: PollPolicy,
    mut fetch: F,
    mut done: P,
) -> Result<T, PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let started = Instant::now();
    let deadline = started.checked_add(policy.timeout);
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let value = fetch().await.map_err(PollError::Fetch)?;
        if done(&value) {
            return Ok(value);
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            return Err(PollError::Timeout {
                waited: started.elapsed(),
                attempts,
            });
        }
        sleep(policy.interval).await;
    }
}
