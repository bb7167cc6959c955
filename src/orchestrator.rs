//! Composition root: turns a region into a ready server address.
//!
//! [`OrchestrationFacade`] wires the account registry, provisioner,
//! dispatcher, assignment watcher, inventory and result waiter around one
//! shared [`FleetState`], then runs each request as the fixed sequence
//! pool, job, dispatch, assignment.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::account::{Account, AccountRegistry};
use crate::batch::BatchService;
use crate::dispatch::{DispatchError, TaskDispatcher, TaskId};
use crate::inventory::{NodeInfo, NodeInventoryAggregator};
use crate::provision::{EnsureError, PoolTemplate, ResourceProvisioner};
use crate::results::{
    DEFAULT_COMPLETION_POLL_INTERVAL, DEFAULT_COMPLETION_TIMEOUT, ResultError, TaskResultWaiter,
};
use crate::state::FleetState;
use crate::watch::{
    DEFAULT_ASSIGNMENT_POLL_INTERVAL, DEFAULT_ASSIGNMENT_TIMEOUT, DEFAULT_NODE_TTL,
    NodeAssignmentWatcher, WatchError,
};

/// Default pool and job name.
pub const DEFAULT_RESOURCE_ID: &str = "GameServers";
/// Default command run by a provisioned server task.
pub const DEFAULT_SERVER_COMMAND: &str = "/bin/bash -c 'sleep 10'";

/// Process-wide names, commands and time budgets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FleetSettings {
    /// Pool hosting server tasks.
    pub pool_id: String,
    /// Job receiving server tasks.
    pub job_id: String,
    /// Command line dispatched by [`OrchestrationFacade::provision`].
    pub server_command: String,
    /// Pause between assignment checks.
    pub assignment_poll_interval: Duration,
    /// Budget for a task to be placed on a node.
    pub assignment_timeout: Duration,
    /// Pause between completion checks.
    pub completion_poll_interval: Duration,
    /// Budget for a task to complete.
    pub completion_timeout: Duration,
    /// Age after which a cached node entry is refreshed before use.
    pub node_ttl: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            pool_id: DEFAULT_RESOURCE_ID.to_owned(),
            job_id: DEFAULT_RESOURCE_ID.to_owned(),
            server_command: DEFAULT_SERVER_COMMAND.to_owned(),
            assignment_poll_interval: DEFAULT_ASSIGNMENT_POLL_INTERVAL,
            assignment_timeout: DEFAULT_ASSIGNMENT_TIMEOUT,
            completion_poll_interval: DEFAULT_COMPLETION_POLL_INTERVAL,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            node_ttl: DEFAULT_NODE_TTL,
        }
    }
}

/// Public address of a provisioned server.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ServerAddress {
    /// Public IP of the hosting node.
    #[serde(rename = "publicIP")]
    pub public_ip: String,
    /// Public port, empty when the node does not report one.
    pub port: String,
}

/// Coarse failure category, stable across error variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The request itself was malformed.
    BadInput,
    /// No account serves the requested region.
    NoAccount,
    /// The remote service failed or rejected a call.
    Provisioning,
    /// A wait ran out of time.
    Timeout,
    /// The service reported an inconsistent view.
    Internal,
}

/// Errors raised by [`OrchestrationFacade`] operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The region was blank.
    #[error("region must not be empty")]
    EmptyRegion,
    /// No account is registered for the region.
    #[error("no batch account serves region {region}")]
    NoAccount {
        /// Requested region.
        region: String,
    },
    /// The pool or job could not be ensured.
    #[error(transparent)]
    Ensure(#[from] EnsureError),
    /// The task could not be submitted.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The task was never placed, or its node could not be resolved.
    #[error(transparent)]
    Assignment(#[from] WatchError),
    /// The task's output could not be collected.
    #[error(transparent)]
    Completion(#[from] ResultError),
    /// The hosting node has no public address.
    #[error("node {node_id} has no public IP address")]
    MissingPublicIp {
        /// Hosting node.
        node_id: String,
    },
}

impl ProvisionError {
    /// Classifies the failure for callers that only need the category.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::EmptyRegion
            | Self::Ensure(EnsureError::InvalidName { .. })
            | Self::Dispatch(DispatchError::EmptyCommand) => FailureKind::BadInput,
            Self::NoAccount { .. } => FailureKind::NoAccount,
            Self::Assignment(err) if err.is_timeout() => FailureKind::Timeout,
            Self::Completion(ResultError::Timeout { .. }) => FailureKind::Timeout,
            Self::Assignment(WatchError::NodeNotFound { .. }) | Self::MissingPublicIp { .. } => {
                FailureKind::Internal
            }
            Self::Ensure(_) | Self::Dispatch(_) | Self::Assignment(_) | Self::Completion(_) => {
                FailureKind::Provisioning
            }
        }
    }
}

/// Entry point for provisioning requests.
pub struct OrchestrationFacade<S> {
    registry: Arc<AccountRegistry>,
    settings: FleetSettings,
    provisioner: ResourceProvisioner<S>,
    dispatcher: TaskDispatcher<S>,
    watcher: NodeAssignmentWatcher<S>,
    inventory: NodeInventoryAggregator<S>,
    results: TaskResultWaiter<S>,
}

impl<S> OrchestrationFacade<S>
where
    S: BatchService + 'static,
{
    /// Builds the facade and the components it drives around fresh state.
    #[must_use]
    pub fn new(
        service: Arc<S>,
        registry: AccountRegistry,
        settings: FleetSettings,
        template: PoolTemplate,
    ) -> Self {
        Self::with_state(service, registry, settings, template, Arc::new(FleetState::new()))
    }

    /// Builds the facade around caller-owned state.
    #[must_use]
    pub fn with_state(
        service: Arc<S>,
        registry: AccountRegistry,
        settings: FleetSettings,
        template: PoolTemplate,
        state: Arc<FleetState>,
    ) -> Self {
        let shared_registry = Arc::new(registry);
        let inventory = NodeInventoryAggregator::new(
            Arc::clone(&service),
            Arc::clone(&state),
            Arc::clone(&shared_registry),
            settings.pool_id.clone(),
        );
        let watcher =
            NodeAssignmentWatcher::new(Arc::clone(&service), Arc::clone(&state), inventory.clone())
                .with_poll_interval(settings.assignment_poll_interval)
                .with_node_ttl(settings.node_ttl);
        Self {
            provisioner: ResourceProvisioner::new(Arc::clone(&service), state, template),
            dispatcher: TaskDispatcher::new(Arc::clone(&service)),
            results: TaskResultWaiter::new(service)
                .with_poll_interval(settings.completion_poll_interval),
            watcher,
            inventory,
            registry: shared_registry,
            settings,
        }
    }

    /// Provisions a server in `region` and returns its public address.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the region is unknown, any remote step
    /// fails, the assignment wait times out, or the node has no public IP.
    pub async fn provision(&self, region: &str) -> Result<ServerAddress, ProvisionError> {
        let started = Instant::now();
        let (account, task_id) = self
            .submit_task(region, &self.settings.server_command)
            .await?;
        let node = self
            .watcher
            .await_node_assignment(
                &account,
                &self.settings.job_id,
                &task_id,
                self.settings.assignment_timeout,
            )
            .await?;
        let address = server_address(node)?;
        info!(
            account = %account.name,
            public_ip = %address.public_ip,
            elapsed = ?started.elapsed(),
            "created server instance"
        );
        Ok(address)
    }

    /// Runs `command_line` in `region` and returns its standard output.
    ///
    /// The task is followed straight to completion. A short command can
    /// finish between two polls without ever being observed running.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the region is unknown, any remote step
    /// fails, the completion wait times out, or the output cannot be fetched.
    pub async fn run_command(
        &self,
        region: &str,
        command_line: &str,
    ) -> Result<String, ProvisionError> {
        let started = Instant::now();
        let (account, task_id) = self.submit_task(region, command_line).await?;
        let output = self
            .results
            .await_completion(
                &account,
                &self.settings.job_id,
                &task_id,
                self.settings.completion_timeout,
            )
            .await?;
        info!(
            account = %account.name,
            task = %task_id,
            elapsed = ?started.elapsed(),
            "task completed"
        );
        Ok(output)
    }

    /// Refreshes every account and returns the nodes it listed, sorted by id.
    ///
    /// Nodes cached by earlier refreshes but absent from this one are not
    /// included.
    pub async fn inventory(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.inventory.refresh().await.into_values().collect();
        nodes.sort_by(|left, right| left.id.cmp(&right.id));
        nodes
    }

    async fn submit_task(
        &self,
        region: &str,
        command_line: &str,
    ) -> Result<(Account, TaskId), ProvisionError> {
        let account = self.account_for(region)?;
        let settings = &self.settings;

        info!(account = %account.name, "checking the pool");
        self.provisioner
            .ensure_pool(&account, &settings.pool_id)
            .await?;
        info!(account = %account.name, "checking the job");
        self.provisioner
            .ensure_job(&account, &settings.pool_id, &settings.job_id)
            .await?;

        let task_id = self
            .dispatcher
            .dispatch(&account, &settings.job_id, command_line)
            .await?;
        Ok((account, task_id))
    }

    fn account_for(&self, region: &str) -> Result<Account, ProvisionError> {
        if region.trim().is_empty() {
            return Err(ProvisionError::EmptyRegion);
        }
        self.registry
            .for_location(region)
            .cloned()
            .ok_or_else(|| ProvisionError::NoAccount {
                region: region.trim().to_owned(),
            })
    }
}

fn server_address(node: NodeInfo) -> Result<ServerAddress, ProvisionError> {
    if node.public_ip.trim().is_empty() {
        return Err(ProvisionError::MissingPublicIp { node_id: node.id });
    }
    Ok(ServerAddress {
        public_ip: node.public_ip,
        port: node.public_port.map(|port| port.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchError, ComputeNode, InboundEndpoint, TaskState};
    use crate::test_support::{BatchCall, ScriptedBatchService, compute_node};
    use rstest::rstest;

    fn facade(service: &Arc<ScriptedBatchService>) -> OrchestrationFacade<ScriptedBatchService> {
        let registry = AccountRegistry::new(vec![
            Account::new("eu-acc", "eu"),
            Account::new("us-acc", "us"),
        ])
        .expect("registry");
        OrchestrationFacade::new(
            Arc::clone(service),
            registry,
            FleetSettings::default(),
            PoolTemplate::default(),
        )
    }

    #[rstest]
    #[case("", FailureKind::BadInput)]
    #[case("   ", FailureKind::BadInput)]
    #[case("asia", FailureKind::NoAccount)]
    #[tokio::test]
    async fn provision_rejects_unroutable_regions(#[case] region: &str, #[case] kind: FailureKind) {
        let service = Arc::new(ScriptedBatchService::new());
        let err = facade(&service)
            .provision(region)
            .await
            .expect_err("region should be rejected");
        assert_eq!(err.kind(), kind);
        assert!(service.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provision_runs_the_full_sequence() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Active, None);
        service.push_task_state(TaskState::Running, Some("node-1"));
        service.set_nodes(
            "eu-acc",
            vec![ComputeNode {
                id: String::from("node-1"),
                inbound_endpoints: vec![InboundEndpoint {
                    public_ip: String::from("52.1.2.3"),
                    frontend_port: Some(50000),
                }],
            }],
        );

        let address = facade(&service).provision("eu").await.expect("provision");

        assert_eq!(
            address,
            ServerAddress {
                public_ip: String::from("52.1.2.3"),
                port: String::from("50000"),
            }
        );
        let calls = service.calls();
        assert!(matches!(calls.first(), Some(BatchCall::CreatePool { .. })));
        assert!(matches!(calls.get(1), Some(BatchCall::CreateJob { .. })));
        assert!(matches!(
            calls.get(2),
            Some(BatchCall::AddTask { command_line, .. }) if command_line == DEFAULT_SERVER_COMMAND
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn provision_reuses_verified_pool_and_job() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Running, Some("node-1"));
        service.set_nodes("eu-acc", vec![compute_node("node-1", "52.1.2.3")]);
        let facade = facade(&service);

        facade.provision("eu").await.expect("first");
        facade.provision("eu").await.expect("second");

        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::CreatePool { .. })),
            1
        );
        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::AddTask { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn node_without_public_ip_is_an_error() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Running, Some("node-1"));
        service.set_nodes(
            "eu-acc",
            vec![ComputeNode {
                id: String::from("node-1"),
                inbound_endpoints: Vec::new(),
            }],
        );

        let err = facade(&service).provision("eu").await.expect_err("no ip");

        assert!(matches!(err, ProvisionError::MissingPublicIp { .. }), "got {err}");
        assert_eq!(err.kind(), FailureKind::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_timeout_maps_to_timeout_kind() {
        let service = Arc::new(ScriptedBatchService::new());

        let err = facade(&service).provision("us").await.expect_err("timeout");

        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::DeleteTask { .. })),
            1
        );
    }

    #[tokio::test]
    async fn pool_failure_stops_before_dispatch() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_create_pool(Err(BatchError::status("create pool", 403, "quota")));

        let err = facade(&service).provision("eu").await.expect_err("pool fails");

        assert_eq!(err.kind(), FailureKind::Provisioning);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_command_returns_task_output() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Running, Some("node-1"));
        service.push_task_state(TaskState::Completed, Some("node-1"));
        service.push_task_file(Ok(b"hello\n".to_vec()));
        service.set_nodes("eu-acc", vec![compute_node("node-1", "52.1.2.3")]);

        let output = facade(&service)
            .run_command("eu", "/bin/echo hello")
            .await
            .expect("output");

        assert_eq!(output, "hello\n");
    }

    #[tokio::test(start_paused = true)]
    async fn run_command_collects_output_of_task_never_seen_running() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Active, None);
        service.push_task_state(TaskState::Completed, Some("node-1"));
        service.push_task_file(Ok(b"hello\n".to_vec()));

        let output = facade(&service)
            .run_command("eu", "/bin/echo hello")
            .await
            .expect("output");

        assert_eq!(output, "hello\n");
        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::DeleteTask { .. })),
            0
        );
        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::TaskFile { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_command_times_out_on_completion_budget() {
        let service = Arc::new(ScriptedBatchService::new());
        service.push_task_state(TaskState::Running, Some("node-1"));

        let err = facade(&service)
            .run_command("eu", "/bin/sleep 600")
            .await
            .expect_err("never completes");

        assert!(matches!(err, ProvisionError::Completion(ResultError::Timeout { .. })), "got {err}");
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(
            service.count_calls(|call| matches!(call, BatchCall::DeleteTask { .. })),
            0
        );
    }

    #[tokio::test]
    async fn inventory_omits_nodes_missing_from_this_refresh() {
        let service = Arc::new(ScriptedBatchService::new());
        service.set_nodes("eu-acc", vec![compute_node("a", "10.0.0.1")]);
        let facade = facade(&service);
        facade.inventory().await;

        service.set_nodes("eu-acc", vec![compute_node("b", "10.0.0.2")]);
        let nodes = facade.inventory().await;

        let ids: Vec<_> = nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn inventory_lists_all_accounts_sorted() {
        let service = Arc::new(ScriptedBatchService::new());
        service.set_nodes("eu-acc", vec![compute_node("b", "10.0.0.2")]);
        service.set_nodes("us-acc", vec![compute_node("a", "10.0.0.1")]);

        let nodes = facade(&service).inventory().await;

        let ids: Vec<_> = nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
