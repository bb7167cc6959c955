//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::account::Account;
use crate::batch::{
    BatchError, BatchFuture, BatchService, ComputeNode, InboundEndpoint, PoolSpec, TaskSnapshot,
    TaskSpec, TaskState,
};

/// Records a single call made through [`ScriptedBatchService`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BatchCall {
    /// `create_pool` was called.
    CreatePool {
        /// Account name.
        account: String,
        /// Pool identifier.
        pool_id: String,
    },
    /// `create_job` was called.
    CreateJob {
        /// Account name.
        account: String,
        /// Job identifier.
        job_id: String,
        /// Pool the job was bound to.
        pool_id: String,
    },
    /// `add_task` was called.
    AddTask {
        /// Account name.
        account: String,
        /// Job identifier.
        job_id: String,
        /// Task identifier.
        task_id: String,
        /// Submitted command line.
        command_line: String,
    },
    /// `get_task` was called.
    GetTask {
        /// Account name.
        account: String,
        /// Task identifier.
        task_id: String,
    },
    /// `delete_task` was called.
    DeleteTask {
        /// Account name.
        account: String,
        /// Task identifier.
        task_id: String,
    },
    /// `list_pool_nodes` was called.
    ListNodes {
        /// Account name.
        account: String,
        /// Pool identifier.
        pool_id: String,
    },
    /// `task_file` was called.
    TaskFile {
        /// Account name.
        account: String,
        /// Task identifier.
        task_id: String,
        /// Requested file name.
        file_name: String,
    },
}

#[derive(Debug, Default)]
struct Script {
    create_pool: VecDeque<Result<(), BatchError>>,
    create_job: VecDeque<Result<(), BatchError>>,
    add_task: VecDeque<Result<(), BatchError>>,
    get_task: VecDeque<Result<TaskSnapshot, BatchError>>,
    last_task: Option<TaskSnapshot>,
    delete_task: VecDeque<Result<(), BatchError>>,
    task_file: VecDeque<Result<Vec<u8>, BatchError>>,
    nodes: HashMap<String, Result<Vec<ComputeNode>, BatchError>>,
    list_delays: HashMap<String, Duration>,
    calls: Vec<BatchCall>,
}

/// Scripted [`BatchService`] returning pre-seeded responses.
///
/// Queued responses are consumed in FIFO order; an empty queue answers with
/// success. `get_task` keeps returning the last scripted snapshot once its
/// queue drains (or an `active` task if none was scripted), which models a
/// task that never progresses. Node listings are configured per account and
/// answered on every call.
#[derive(Debug, Default)]
pub struct ScriptedBatchService {
    script: Mutex<Script>,
}

impl ScriptedBatchService {
    /// Creates a service with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of the next `create_pool` call.
    pub fn push_create_pool(&self, result: Result<(), BatchError>) {
        self.script().create_pool.push_back(result);
    }

    /// Queues the outcome of the next `create_job` call.
    pub fn push_create_job(&self, result: Result<(), BatchError>) {
        self.script().create_job.push_back(result);
    }

    /// Queues the outcome of the next `add_task` call.
    pub fn push_add_task(&self, result: Result<(), BatchError>) {
        self.script().add_task.push_back(result);
    }

    /// Queues a task snapshot with the given state and node.
    pub fn push_task_state(&self, state: TaskState, node_id: Option<&str>) {
        self.script().get_task.push_back(Ok(TaskSnapshot {
            id: String::new(),
            state,
            node_id: node_id.map(str::to_owned),
        }));
    }

    /// Queues a failing `get_task` response.
    pub fn push_task_error(&self, error: BatchError) {
        self.script().get_task.push_back(Err(error));
    }

    /// Queues the outcome of the next `delete_task` call.
    pub fn push_delete_task(&self, result: Result<(), BatchError>) {
        self.script().delete_task.push_back(result);
    }

    /// Queues the outcome of the next `task_file` call.
    pub fn push_task_file(&self, result: Result<Vec<u8>, BatchError>) {
        self.script().task_file.push_back(result);
    }

    /// Sets the nodes listed for `account`.
    pub fn set_nodes(&self, account: &str, nodes: Vec<ComputeNode>) {
        self.script().nodes.insert(account.to_owned(), Ok(nodes));
    }

    /// Makes node listing fail for `account`.
    pub fn fail_nodes(&self, account: &str, error: BatchError) {
        self.script().nodes.insert(account.to_owned(), Err(error));
    }

    /// Delays node listing for `account`, to vary completion order.
    pub fn set_list_delay(&self, account: &str, delay: Duration) {
        self.script().list_delays.insert(account.to_owned(), delay);
    }

    /// Returns a snapshot of all calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BatchCall> {
        self.script().calls.clone()
    }

    /// Counts recorded calls matching `predicate`.
    #[must_use]
    pub fn count_calls(&self, predicate: impl Fn(&BatchCall) -> bool) -> usize {
        self.script().calls.iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: BatchCall) {
        self.script().calls.push(call);
    }
}

impl BatchService for ScriptedBatchService {
    fn create_pool<'a>(
        &'a self,
        account: &'a Account,
        pool: &'a PoolSpec,
    ) -> BatchFuture<'a, ()> {
        self.record(BatchCall::CreatePool {
            account: account.name.clone(),
            pool_id: pool.id.clone(),
        });
        let result = self.script().create_pool.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn create_job<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> BatchFuture<'a, ()> {
        self.record(BatchCall::CreateJob {
            account: account.name.clone(),
            job_id: job_id.to_owned(),
            pool_id: pool_id.to_owned(),
        });
        let result = self.script().create_job.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn add_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> BatchFuture<'a, ()> {
        self.record(BatchCall::AddTask {
            account: account.name.clone(),
            job_id: job_id.to_owned(),
            task_id: task.id.clone(),
            command_line: task.command_line.clone(),
        });
        let result = self.script().add_task.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn get_task<'a>(
        &'a self,
        account: &'a Account,
        _job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, TaskSnapshot> {
        self.record(BatchCall::GetTask {
            account: account.name.clone(),
            task_id: task_id.to_owned(),
        });
        let result = {
            let mut script = self.script();
            match script.get_task.pop_front() {
                Some(Ok(mut snapshot)) => {
                    task_id.clone_into(&mut snapshot.id);
                    script.last_task = Some(snapshot.clone());
                    Ok(snapshot)
                }
                Some(Err(err)) => Err(err),
                None => Ok(script.last_task.clone().unwrap_or_else(|| TaskSnapshot {
                    id: task_id.to_owned(),
                    state: TaskState::Active,
                    node_id: None,
                })),
            }
        };
        Box::pin(async move { result })
    }

    fn delete_task<'a>(
        &'a self,
        account: &'a Account,
        _job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, ()> {
        self.record(BatchCall::DeleteTask {
            account: account.name.clone(),
            task_id: task_id.to_owned(),
        });
        let result = self.script().delete_task.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn list_pool_nodes<'a>(
        &'a self,
        account: &'a Account,
        pool_id: &'a str,
    ) -> BatchFuture<'a, Vec<ComputeNode>> {
        self.record(BatchCall::ListNodes {
            account: account.name.clone(),
            pool_id: pool_id.to_owned(),
        });
        let (result, delay) = {
            let script = self.script();
            (
                script
                    .nodes
                    .get(&account.name)
                    .cloned()
                    .unwrap_or_else(|| Ok(Vec::new())),
                script.list_delays.get(&account.name).copied(),
            )
        };
        Box::pin(async move {
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            result
        })
    }

    fn task_file<'a>(
        &'a self,
        account: &'a Account,
        _job_id: &'a str,
        task_id: &'a str,
        file_name: &'a str,
    ) -> BatchFuture<'a, Vec<u8>> {
        self.record(BatchCall::TaskFile {
            account: account.name.clone(),
            task_id: task_id.to_owned(),
            file_name: file_name.to_owned(),
        });
        let result = self.script().task_file.pop_front().unwrap_or_else(|| Ok(Vec::new()));
        Box::pin(async move { result })
    }
}

/// Builds a node with a single inbound endpoint at `public_ip`.
#[must_use]
pub fn compute_node(id: &str, public_ip: &str) -> ComputeNode {
    ComputeNode {
        id: id.to_owned(),
        inbound_endpoints: vec![InboundEndpoint {
            public_ip: public_ip.to_owned(),
            frontend_port: None,
        }],
    }
}

/// Conflict error as returned when creating an existing resource.
#[must_use]
pub fn conflict(operation: &str) -> BatchError {
    BatchError::Status {
        operation: operation.to_owned(),
        status: 409,
        code: Some(String::from("PoolExists")),
        message: String::from("The specified resource already exists."),
    }
}

/// Not-found error as returned for a missing resource.
#[must_use]
pub fn not_found(operation: &str) -> BatchError {
    BatchError::status(operation, 404, "The specified resource does not exist.")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets several environment variables while holding [`ENV_LOCK`].
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
