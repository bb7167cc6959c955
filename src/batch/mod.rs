//! Remote batch-compute service abstraction.
//!
//! The orchestration layer only talks to the provider through
//! [`BatchService`]. [`RestBatchService`] implements it against the Azure Batch
//! REST API; tests substitute the scripted double in
//! [`crate::test_support`].

mod auth;
mod error;
mod rest;
mod wire;

use std::future::Future;
use std::pin::Pin;

use crate::account::Account;

pub use auth::{AzureCredentials, TokenSource};
pub use error::{BatchError, ErrorClass, classify};
pub use rest::RestBatchService;

/// Future returned by [`BatchService`] operations.
pub type BatchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BatchError>> + Send + 'a>>;

/// Marketplace image used for pool nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageReference {
    /// Image publisher (for example `Canonical`).
    pub publisher: String,
    /// Image offer (for example `UbuntuServer`).
    pub offer: String,
    /// Image SKU (for example `16.04-LTS`).
    pub sku: String,
    /// Image version, usually `latest`.
    pub version: String,
}

/// Bootstrap command run on every node before it accepts tasks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartTask {
    /// Shell command executed on the node.
    pub command_line: String,
    /// Optional file downloaded into the task directory before the command runs.
    pub resource: Option<ResourceFile>,
    /// Whether the node stays unusable until the command succeeds.
    pub wait_for_success: bool,
}

/// File fetched from a URL into a task working directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceFile {
    /// Source URL.
    pub source_url: String,
    /// Path relative to the task working directory.
    pub file_path: String,
    /// Octal file mode applied after download.
    pub file_mode: String,
}

/// Parameters for creating a pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolSpec {
    /// Pool identifier.
    pub id: String,
    /// VM size for every node in the pool.
    pub vm_size: String,
    /// Image booted on each node.
    pub image: ImageReference,
    /// Node agent SKU matching the image.
    pub node_agent_sku_id: String,
    /// Maximum concurrent tasks per node.
    pub max_tasks_per_node: u32,
    /// Initial dedicated node count.
    pub target_dedicated_nodes: u32,
    /// Bootstrap run on each node.
    pub start_task: StartTask,
}

/// Parameters for adding a task to a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSpec {
    /// Caller generated task identifier.
    pub id: String,
    /// Command line executed on the node.
    pub command_line: String,
}

/// Task lifecycle states reported by the service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Queued and not yet scheduled.
    Active,
    /// Scheduled; the node is preparing to run it.
    Preparing,
    /// Running on a node.
    Running,
    /// Finished, successfully or not.
    Completed,
    /// A state this crate does not model.
    Other(String),
}

impl TaskState {
    /// Parses the provider's state string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "preparing" => Self::Preparing,
            "running" => Self::Running,
            "completed" => Self::Completed,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Point-in-time view of a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: String,
    /// Current state.
    pub state: TaskState,
    /// Node running the task, when the service reports one.
    pub node_id: Option<String>,
}

impl TaskSnapshot {
    /// Node the task is running on, once it is both running and placed.
    #[must_use]
    pub fn assigned_node(&self) -> Option<&str> {
        if self.state != TaskState::Running {
            return None;
        }
        self.node_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Whether the task reached its terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }
}

/// Public endpoint forwarding traffic to a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundEndpoint {
    /// Public IP address of the endpoint.
    pub public_ip: String,
    /// Public port, when reported.
    pub frontend_port: Option<u16>,
}

/// A node currently in a pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputeNode {
    /// Node identifier.
    pub id: String,
    /// Inbound endpoints configured for the node, in provider order.
    pub inbound_endpoints: Vec<InboundEndpoint>,
}

/// Operations the orchestration layer needs from a batch-compute service.
pub trait BatchService: Send + Sync {
    /// Creates a pool. An existing pool surfaces as a conflict error.
    fn create_pool<'a>(&'a self, account: &'a Account, pool: &'a PoolSpec)
    -> BatchFuture<'a, ()>;

    /// Creates a job bound to a pool. An existing job surfaces as a conflict.
    fn create_job<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> BatchFuture<'a, ()>;

    /// Adds a task to a job.
    fn add_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> BatchFuture<'a, ()>;

    /// Fetches the current state of a task.
    fn get_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, TaskSnapshot>;

    /// Deletes a task. A missing task surfaces as a not-found error.
    fn delete_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, ()>;

    /// Lists the nodes currently in a pool.
    fn list_pool_nodes<'a>(
        &'a self,
        account: &'a Account,
        pool_id: &'a str,
    ) -> BatchFuture<'a, Vec<ComputeNode>>;

    /// Downloads a file from a task's working directory.
    fn task_file<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
        file_name: &'a str,
    ) -> BatchFuture<'a, Vec<u8>>;
}
