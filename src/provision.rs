//! Idempotent pool and job bring-up.
//!
//! Creating a resource that already exists is reported by the service as a
//! conflict, which counts as success here. Verified resources are remembered
//! in [`FleetState`] so later requests skip the remote call; that flag is only
//! a shortcut and correctness never depends on it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::account::Account;
use crate::batch::{
    BatchError, BatchService, ErrorClass, ImageReference, PoolSpec, ResourceFile, StartTask,
    classify,
};
use crate::state::FleetState;

/// Default VM size for pool nodes.
pub const DEFAULT_VM_SIZE: &str = "standard_a1";
/// Default bootstrap script downloaded by each node's start task.
pub const DEFAULT_START_TASK_URL: &str = "https://raw.githubusercontent.com/lawrencegripper/azure-sdk-for-go-samples/1441a1dc4a6f7e47c4f6d8b537cf77ce4f7c452c/batch/examplestartup.sh";
/// Default start task command.
pub const DEFAULT_START_TASK_COMMAND: &str = "bash -f echohello.sh";
const START_TASK_FILE: &str = "echohello.sh";

/// Node template applied when a pool has to be created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolTemplate {
    /// VM size for every node.
    pub vm_size: String,
    /// Marketplace image.
    pub image: ImageReference,
    /// Node agent SKU matching the image.
    pub node_agent_sku_id: String,
    /// URL of the bootstrap script fetched by the start task.
    pub start_task_url: String,
    /// Command run by the start task.
    pub start_task_command: String,
}

impl Default for PoolTemplate {
    fn default() -> Self {
        Self {
            vm_size: DEFAULT_VM_SIZE.to_owned(),
            image: ImageReference {
                publisher: String::from("Canonical"),
                offer: String::from("UbuntuServer"),
                sku: String::from("16.04-LTS"),
                version: String::from("latest"),
            },
            node_agent_sku_id: String::from("batch.node.ubuntu 16.04"),
            start_task_url: DEFAULT_START_TASK_URL.to_owned(),
            start_task_command: DEFAULT_START_TASK_COMMAND.to_owned(),
        }
    }
}

impl PoolTemplate {
    /// Renders the creation request for `pool_id`.
    ///
    /// Pools run one task per node and start with no dedicated nodes; the
    /// start task must succeed before a node accepts work.
    #[must_use]
    pub fn pool_spec(&self, pool_id: &str) -> PoolSpec {
        PoolSpec {
            id: pool_id.to_owned(),
            vm_size: self.vm_size.clone(),
            image: self.image.clone(),
            node_agent_sku_id: self.node_agent_sku_id.clone(),
            max_tasks_per_node: 1,
            target_dedicated_nodes: 0,
            start_task: StartTask {
                command_line: self.start_task_command.clone(),
                resource: Some(ResourceFile {
                    source_url: self.start_task_url.clone(),
                    file_path: START_TASK_FILE.to_owned(),
                    file_mode: String::from("777"),
                }),
                wait_for_success: true,
            },
        }
    }
}

/// Errors raised while ensuring a pool or job exists.
#[derive(Debug, Error)]
pub enum EnsureError {
    /// A resource name was blank.
    #[error("{field} must not be empty")]
    InvalidName {
        /// Name of the offending argument.
        field: &'static str,
    },
    /// Pool creation failed with something other than a conflict.
    #[error("failed to ensure pool {pool_id}: {source}")]
    Pool {
        /// Pool identifier.
        pool_id: String,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
    /// Job creation failed with something other than a conflict.
    #[error("failed to ensure job {job_id}: {source}")]
    Job {
        /// Job identifier.
        job_id: String,
        /// Underlying service error.
        #[source]
        source: BatchError,
    },
}

/// Ensures pools and jobs exist before tasks are dispatched.
pub struct ResourceProvisioner<S> {
    service: Arc<S>,
    state: Arc<FleetState>,
    template: PoolTemplate,
}

impl<S> ResourceProvisioner<S>
where
    S: BatchService,
{
    /// Creates a provisioner.
    #[must_use]
    pub const fn new(service: Arc<S>, state: Arc<FleetState>, template: PoolTemplate) -> Self {
        Self {
            service,
            state,
            template,
        }
    }

    /// Ensures `pool_id` exists on `account`.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError::InvalidName`] for a blank id and
    /// [`EnsureError::Pool`] when creation fails for any reason other than
    /// the pool already existing.
    pub async fn ensure_pool(&self, account: &Account, pool_id: &str) -> Result<(), EnsureError> {
        require_name("pool id", pool_id)?;
        if self.state.pools().is_set(&account.name, pool_id).await {
            return Ok(());
        }

        let spec = self.template.pool_spec(pool_id);
        match self.service.create_pool(account, &spec).await {
            Ok(()) => info!(account = %account.name, pool = pool_id, "created pool"),
            Err(err) if classify(&err) == ErrorClass::Conflict => {
                debug!(account = %account.name, pool = pool_id, "pool already exists");
            }
            Err(source) => {
                return Err(EnsureError::Pool {
                    pool_id: pool_id.to_owned(),
                    source,
                });
            }
        }
        self.state.pools().set(&account.name, pool_id).await;
        Ok(())
    }

    /// Ensures `job_id` exists on `account`, bound to `pool_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError::InvalidName`] for a blank id and
    /// [`EnsureError::Job`] when creation fails for any reason other than the
    /// job already existing.
    pub async fn ensure_job(
        &self,
        account: &Account,
        pool_id: &str,
        job_id: &str,
    ) -> Result<(), EnsureError> {
        require_name("pool id", pool_id)?;
        require_name("job id", job_id)?;
        if self.state.jobs().is_set(&account.name, job_id).await {
            return Ok(());
        }

        match self.service.create_job(account, job_id, pool_id).await {
            Ok(()) => info!(account = %account.name, job = job_id, "created job"),
            Err(err) if classify(&err) == ErrorClass::Conflict => {
                debug!(account = %account.name, job = job_id, "job already exists");
            }
            Err(source) => {
                return Err(EnsureError::Job {
                    job_id: job_id.to_owned(),
                    source,
                });
            }
        }
        self.state.jobs().set(&account.name, job_id).await;
        Ok(())
    }
}

fn require_name(field: &'static str, value: &str) -> Result<(), EnsureError> {
    if value.trim().is_empty() {
        return Err(EnsureError::InvalidName { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BatchCall, ScriptedBatchService, conflict};
    use rstest::{fixture, rstest};

    struct Harness {
        service: Arc<ScriptedBatchService>,
        state: Arc<FleetState>,
        provisioner: ResourceProvisioner<ScriptedBatchService>,
    }

    #[fixture]
    fn harness() -> Harness {
        let service = Arc::new(ScriptedBatchService::new());
        let state = Arc::new(FleetState::new());
        let provisioner = ResourceProvisioner::new(
            Arc::clone(&service),
            Arc::clone(&state),
            PoolTemplate::default(),
        );
        Harness {
            service,
            state,
            provisioner,
        }
    }

    fn account() -> Account {
        Account::new("eu-acc", "eu")
    }

    fn create_pool_calls(service: &ScriptedBatchService) -> usize {
        service.count_calls(|call| matches!(call, BatchCall::CreatePool { .. }))
    }

    #[rstest]
    fn default_template_requires_start_task_success() {
        let spec = PoolTemplate::default().pool_spec("GameServers");
        assert_eq!(spec.max_tasks_per_node, 1);
        assert_eq!(spec.target_dedicated_nodes, 0);
        assert!(spec.start_task.wait_for_success);
        assert_eq!(spec.start_task.command_line, "bash -f echohello.sh");
        let resource = spec.start_task.resource.expect("bootstrap script");
        assert_eq!(resource.file_path, "echohello.sh");
        assert_eq!(resource.file_mode, "777");
    }

    #[rstest]
    #[tokio::test]
    async fn ensure_pool_twice_is_ok_and_skips_second_call(harness: Harness) {
        let account = account();
        harness
            .provisioner
            .ensure_pool(&account, "GameServers")
            .await
            .expect("first ensure");
        harness
            .provisioner
            .ensure_pool(&account, "GameServers")
            .await
            .expect("second ensure");
        assert_eq!(create_pool_calls(&harness.service), 1);
        assert!(harness.state.pools().is_set("eu-acc", "GameServers").await);
    }

    #[rstest]
    #[tokio::test]
    async fn conflict_counts_as_success(harness: Harness) {
        harness.service.push_create_pool(Err(conflict("create pool")));
        harness.service.push_create_job(Err(conflict("create job")));
        let account = account();

        harness
            .provisioner
            .ensure_pool(&account, "GameServers")
            .await
            .expect("conflict on pool is success");
        harness
            .provisioner
            .ensure_job(&account, "GameServers", "GameServers")
            .await
            .expect("conflict on job is success");
        assert!(harness.state.jobs().is_set("eu-acc", "GameServers").await);
    }

    #[rstest]
    #[tokio::test]
    async fn fresh_state_against_existing_pool_still_succeeds(harness: Harness) {
        // A restarted process has no flags, but the pool already exists remotely.
        harness.service.push_create_pool(Ok(()));
        harness.service.push_create_pool(Err(conflict("create pool")));
        let account = account();
        harness
            .provisioner
            .ensure_pool(&account, "GameServers")
            .await
            .expect("create");

        let restarted = ResourceProvisioner::new(
            Arc::clone(&harness.service),
            Arc::new(FleetState::new()),
            PoolTemplate::default(),
        );
        restarted
            .ensure_pool(&account, "GameServers")
            .await
            .expect("existing pool is success");
        assert_eq!(create_pool_calls(&harness.service), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn other_errors_propagate_and_leave_flag_unset(harness: Harness) {
        harness
            .service
            .push_create_pool(Err(BatchError::status("create pool", 403, "forbidden")));
        let account = account();

        let err = harness
            .provisioner
            .ensure_pool(&account, "GameServers")
            .await
            .expect_err("forbidden should propagate");
        assert!(
            matches!(
                err,
                EnsureError::Pool {
                    source: BatchError::Status { status: 403, .. },
                    ..
                }
            ),
            "unexpected error: {err}"
        );
        assert!(!harness.state.pools().is_set("eu-acc", "GameServers").await);
    }

    #[rstest]
    #[case("", "GameServers", "pool id")]
    #[case("GameServers", "  ", "job id")]
    #[tokio::test]
    async fn ensure_job_rejects_blank_names(
        harness: Harness,
        #[case] pool_id: &str,
        #[case] job_id: &str,
        #[case] field: &str,
    ) {
        let err = harness
            .provisioner
            .ensure_job(&account(), pool_id, job_id)
            .await
            .expect_err("blank name");
        assert!(matches!(err, EnsureError::InvalidName { field: f } if f == field));
        assert!(harness.service.calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn flags_are_per_account(harness: Harness) {
        let eu = account();
        let us = Account::new("us-acc", "us");
        harness
            .provisioner
            .ensure_job(&eu, "GameServers", "GameServers")
            .await
            .expect("eu job");
        harness
            .provisioner
            .ensure_job(&us, "GameServers", "GameServers")
            .await
            .expect("us job");
        assert_eq!(
            harness
                .service
                .count_calls(|call| matches!(call, BatchCall::CreateJob { .. })),
            2
        );
    }
}
