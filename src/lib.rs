//! Core library for the batchfleet provisioning tool.
//!
//! The crate turns a requested region into the public address of a game
//! server running on an Azure Batch pool. It ensures the pool and job exist,
//! dispatches a task, waits for the service to place it on a node, and
//! resolves that node through an inventory gathered concurrently from every
//! configured batch account.

pub mod account;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod inventory;
pub mod orchestrator;
pub mod poll;
pub mod provision;
pub mod results;
pub mod state;
pub mod test_support;
pub mod watch;

pub use account::{Account, AccountError, AccountRegistry};
pub use batch::{BatchError, BatchService, ErrorClass, RestBatchService, classify};
pub use config::{ConfigError, FleetConfig};
pub use dispatch::{DispatchError, TaskDispatcher, TaskId};
pub use inventory::{NodeInfo, NodeInventoryAggregator};
pub use orchestrator::{
    FailureKind, FleetSettings, OrchestrationFacade, ProvisionError, ServerAddress,
};
pub use poll::{PollError, PollPolicy, poll_until};
pub use provision::{EnsureError, PoolTemplate, ResourceProvisioner};
pub use results::{ResultError, TaskResultWaiter};
pub use state::FleetState;
pub use watch::{NodeAssignmentWatcher, WatchError};
