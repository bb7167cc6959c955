//! Task submission.

use std::fmt;
use std::sync::Arc;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::account::Account;
use crate::batch::{BatchError, BatchService, TaskSpec};

/// Identifier of a dispatched task, unique per dispatch.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrows the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Errors raised while submitting a task.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command line was blank.
    #[error("task command line must not be empty")]
    EmptyCommand,
    /// The service rejected the submission.
    #[error("failed to submit task {task_id}: {source}")]
    Submit {
        /// Identifier generated for the rejected task.
        task_id: TaskId,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
}

/// Submits single-command tasks into existing jobs.
pub struct TaskDispatcher<S> {
    service: Arc<S>,
}

impl<S> TaskDispatcher<S>
where
    S: BatchService,
{
    /// Creates a dispatcher.
    #[must_use]
    pub const fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// Adds a task running `command_line` to `job_id` and returns its id.
    ///
    /// The task runs under a task-scoped admin identity. Failures are not
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EmptyCommand`] for a blank command line and
    /// [`DispatchError::Submit`] when the service rejects the task.
    pub async fn dispatch(
        &self,
        account: &Account,
        job_id: &str,
        command_line: &str,
    ) -> Result<TaskId, DispatchError> {
        if command_line.trim().is_empty() {
            return Err(DispatchError::EmptyCommand);
        }
        let task_id = TaskId::generate();
        let spec = TaskSpec {
            id: task_id.as_str().to_owned(),
            command_line: command_line.to_owned(),
        };
        match self.service.add_task(account, job_id, &spec).await {
            Ok(()) => {
                info!(account = %account.name, job = job_id, task = %task_id, "dispatched task");
                Ok(task_id)
            }
            Err(source) => Err(DispatchError::Submit { task_id, source }),
        }
    }
}

/// Renders `script` as a `/bin/bash -c` command line.
#[must_use]
pub fn shell_command(script: &str) -> String {
    format!("/bin/bash -c {}", escape(script.into()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::test_support::{BatchCall, ScriptedBatchService};
    use rstest::rstest;

    fn dispatcher() -> (Arc<ScriptedBatchService>, TaskDispatcher<ScriptedBatchService>) {
        let service = Arc::new(ScriptedBatchService::new());
        (Arc::clone(&service), TaskDispatcher::new(service))
    }

    #[tokio::test]
    async fn dispatch_submits_command_with_generated_id() {
        let (service, dispatcher) = dispatcher();
        let account = Account::new("eu-acc", "eu");

        let task_id = dispatcher
            .dispatch(&account, "GameServers", "/bin/echo hello")
            .await
            .expect("dispatch");

        assert!(Uuid::parse_str(task_id.as_str()).is_ok(), "task id: {task_id}");
        assert_eq!(
            service.calls(),
            vec![BatchCall::AddTask {
                account: String::from("eu-acc"),
                job_id: String::from("GameServers"),
                task_id: task_id.to_string(),
                command_line: String::from("/bin/echo hello"),
            }]
        );
    }

    #[tokio::test]
    async fn task_ids_are_unique_per_dispatch() {
        let (_service, dispatcher) = dispatcher();
        let account = Account::new("eu-acc", "eu");
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let id = dispatcher
                .dispatch(&account, "GameServers", "true")
                .await
                .expect("dispatch");
            assert!(seen.insert(id), "duplicate task id");
        }
    }

    #[tokio::test]
    async fn submission_failure_propagates_without_retry() {
        let (service, dispatcher) = dispatcher();
        service.push_add_task(Err(BatchError::status("add task", 500, "boom")));

        let err = dispatcher
            .dispatch(&Account::new("eu-acc", "eu"), "GameServers", "true")
            .await
            .expect_err("submission fails");

        assert!(matches!(err, DispatchError::Submit { .. }), "got {err}");
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn blank_command_is_rejected_locally() {
        let (service, dispatcher) = dispatcher();
        let err = dispatcher
            .dispatch(&Account::new("eu-acc", "eu"), "GameServers", "   ")
            .await
            .expect_err("blank command");
        assert!(matches!(err, DispatchError::EmptyCommand));
        assert!(service.calls().is_empty());
    }

    #[rstest]
    #[case("sleep 10", "/bin/bash -c 'sleep 10'")]
    #[case("echo it's", "/bin/bash -c 'echo it'\\''s'")]
    #[case("uptime", "/bin/bash -c uptime")]
    fn shell_command_escapes_script(#[case] script: &str, #[case] expected: &str) {
        assert_eq!(shell_command(script), expected);
    }
}
