//! Waiting for task completion and collecting its output.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::account::Account;
use crate::batch::{BatchError, BatchService};
use crate::dispatch::TaskId;
use crate::poll::{PollError, PollPolicy, poll_until};

/// Default pause between completion checks.
pub const DEFAULT_COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Default budget for a task to complete.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(240);
/// Captured standard output file in the task directory.
pub const STDOUT_FILE: &str = "stdout.txt";

/// Errors raised while waiting for a task's output.
#[derive(Debug, Error)]
pub enum ResultError {
    /// The task did not complete before the deadline.
    #[error("task {task_id} did not complete within {waited:?}")]
    Timeout {
        /// Task being waited on.
        task_id: TaskId,
        /// Time spent waiting.
        waited: Duration,
    },
    /// Fetching the task state failed.
    #[error("failed to poll task {task_id}: {source}")]
    Poll {
        /// Task being waited on.
        task_id: TaskId,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
    /// The task completed but its output could not be downloaded.
    #[error("failed to fetch output of task {task_id}: {source}")]
    Output {
        /// Completed task.
        task_id: TaskId,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
}

/// Polls tasks to completion and returns their standard output.
pub struct TaskResultWaiter<S> {
    service: Arc<S>,
    poll_interval: Duration,
}

impl<S> TaskResultWaiter<S>
where
    S: BatchService,
{
    /// Creates a waiter using the default poll interval.
    #[must_use]
    pub const fn new(service: Arc<S>) -> Self {
        Self {
            service,
            poll_interval: DEFAULT_COMPLETION_POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits for `task_id` to complete and returns its stdout, decoded as
    /// UTF-8 with invalid sequences replaced.
    ///
    /// Nothing is cleaned up on timeout; the task keeps running remotely.
    ///
    /// # Errors
    ///
    /// Returns [`ResultError::Timeout`] when the deadline passes,
    /// [`ResultError::Poll`] when a state check fails, and
    /// [`ResultError::Output`] when the output download fails.
    pub async fn await_completion(
        &self,
        account: &Account,
        job_id: &str,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<String, ResultError> {
        let policy = PollPolicy::new(self.poll_interval, timeout);
        poll_until(
            policy,
            || self.service.get_task(account, job_id, task_id.as_str()),
            |snapshot| snapshot.is_completed(),
        )
        .await
        .map_err(|err| match err {
            PollError::Timeout { waited, .. } => {
                warn!(task = %task_id, ?waited, "task did not complete in time");
                ResultError::Timeout {
                    task_id: task_id.clone(),
                    waited,
                }
            }
            PollError::Fetch(source) => ResultError::Poll {
                task_id: task_id.clone(),
                source,
            },
        })?;

        let bytes = self
            .service
            .task_file(account, job_id, task_id.as_str(), STDOUT_FILE)
            .await
            .map_err(|source| ResultError::Output {
                task_id: task_id.clone(),
                source,
            })?;
        debug!(task = %task_id, bytes = bytes.len(), "fetched task output");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
