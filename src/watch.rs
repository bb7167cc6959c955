//! Waiting for a dispatched task to land on a node.
//!
//! The watcher polls the task until the service reports it running on a
//! node, then resolves that node through the inventory cache. A task still
//! unplaced at the deadline is deleted so it cannot start later on capacity
//! nobody is waiting for.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::batch::{BatchError, BatchService, ErrorClass, classify};
use crate::dispatch::TaskId;
use crate::inventory::{NodeInfo, NodeInventoryAggregator};
use crate::poll::{PollError, PollPolicy, poll_until};
use crate::state::FleetState;

/// Default pause between task state checks.
pub const DEFAULT_ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default budget for a task to be placed on a node.
pub const DEFAULT_ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(180);
/// Default age after which a cached node entry is no longer trusted.
pub const DEFAULT_NODE_TTL: Duration = Duration::from_secs(600);

/// Errors raised while waiting for node assignment.
#[derive(Debug, Error)]
pub enum WatchError {
    /// No node was assigned before the deadline; the task was deleted.
    #[error("task {task_id} was not assigned a node within {waited:?}")]
    Timeout {
        /// Abandoned task.
        task_id: TaskId,
        /// Time spent waiting.
        waited: Duration,
    },
    /// No node was assigned before the deadline and deleting the task failed.
    #[error("task {task_id} was not assigned a node within {waited:?} and could not be deleted: {source}")]
    CleanupFailed {
        /// Abandoned task, possibly still queued remotely.
        task_id: TaskId,
        /// Time spent waiting.
        waited: Duration,
        /// Error returned by the delete call.
        #[source]
        source: BatchError,
    },
    /// Fetching the task state failed.
    #[error("failed to poll task {task_id}: {source}")]
    Fetch {
        /// Task being watched.
        task_id: TaskId,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
    /// The assigned node was missing from the inventory even after a refresh.
    #[error("task {task_id} was assigned to node {node_id}, which is not in the pool inventory after refresh")]
    NodeNotFound {
        /// Task being watched.
        task_id: TaskId,
        /// Node reported by the service.
        node_id: String,
    },
}

impl WatchError {
    /// Whether the wait ran out of time, regardless of cleanup outcome.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::CleanupFailed { .. })
    }
}

/// Polls tasks until they are placed and resolves the hosting node.
pub struct NodeAssignmentWatcher<S> {
    service: Arc<S>,
    state: Arc<FleetState>,
    inventory: NodeInventoryAggregator<S>,
    poll_interval: Duration,
    node_ttl: Duration,
}

impl<S> NodeAssignmentWatcher<S>
where
    S: BatchService + 'static,
{
    /// Creates a watcher with the default poll interval and node TTL.
    #[must_use]
    pub const fn new(
        service: Arc<S>,
        state: Arc<FleetState>,
        inventory: NodeInventoryAggregator<S>,
    ) -> Self {
        Self {
            service,
            state,
            inventory,
            poll_interval: DEFAULT_ASSIGNMENT_POLL_INTERVAL,
            node_ttl: DEFAULT_NODE_TTL,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides how long a cached node entry is trusted.
    #[must_use]
    pub const fn with_node_ttl(mut self, ttl: Duration) -> Self {
        self.node_ttl = ttl;
        self
    }

    /// Waits until `task_id` runs on a node and returns that node.
    ///
    /// A node id missing from the cache (or cached longer ago than the node
    /// TTL) triggers exactly one inventory refresh before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Timeout`] or [`WatchError::CleanupFailed`] when
    /// the deadline passes, [`WatchError::Fetch`] when polling fails, and
    /// [`WatchError::NodeNotFound`] when the node cannot be resolved.
    pub async fn await_node_assignment(
        &self,
        account: &Account,
        job_id: &str,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<NodeInfo, WatchError> {
        let policy = PollPolicy::new(self.poll_interval, timeout);
        let polled = poll_until(
            policy,
            || self.service.get_task(account, job_id, task_id.as_str()),
            |snapshot| snapshot.assigned_node().is_some(),
        )
        .await;

        let snapshot = match polled {
            Ok(snapshot) => snapshot,
            Err(PollError::Fetch(source)) => {
                return Err(WatchError::Fetch {
                    task_id: task_id.clone(),
                    source,
                });
            }
            Err(PollError::Timeout { waited, .. }) => {
                return Err(self.abandon(account, job_id, task_id, waited).await);
            }
        };

        let node_id = snapshot.assigned_node().unwrap_or_default().to_owned();
        debug!(task = %task_id, node = %node_id, "task assigned");
        self.resolve_node(task_id, node_id).await
    }

    async fn abandon(
        &self,
        account: &Account,
        job_id: &str,
        task_id: &TaskId,
        waited: Duration,
    ) -> WatchError {
        warn!(task = %task_id, ?waited, "task was not assigned in time, deleting it");
        match self
            .service
            .delete_task(account, job_id, task_id.as_str())
            .await
        {
            Ok(()) => {}
            Err(err) if classify(&err) == ErrorClass::NotFound => {
                debug!(task = %task_id, "abandoned task already gone");
            }
            Err(source) => {
                return WatchError::CleanupFailed {
                    task_id: task_id.clone(),
                    waited,
                    source,
                };
            }
        }
        WatchError::Timeout {
            task_id: task_id.clone(),
            waited,
        }
    }

    async fn resolve_node(&self, task_id: &TaskId, node_id: String) -> Result<NodeInfo, WatchError> {
        let cache = self.state.nodes();
        if let Some(node) = cache.lookup_fresh(&node_id, self.node_ttl).await {
            return Ok(node);
        }

        info!(node = %node_id, "node not cached, refreshing inventory");
        let started = Instant::now();
        self.inventory.refresh().await;
        debug!(elapsed = ?started.elapsed(), "inventory refresh finished");

        match cache.lookup_fresh(&node_id, self.node_ttl).await {
            Some(node) => Ok(node),
            None => Err(WatchError::NodeNotFound {
                task_id: task_id.clone(),
                node_id,
            }),
        }
    }
}
