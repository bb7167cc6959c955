//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::account::{AccountError, AccountRegistry};
use crate::batch::AzureCredentials;
use crate::orchestrator::{DEFAULT_RESOURCE_ID, DEFAULT_SERVER_COMMAND, FleetSettings};
use crate::provision::{
    DEFAULT_START_TASK_COMMAND, DEFAULT_START_TASK_URL, DEFAULT_VM_SIZE, PoolTemplate,
};

/// Fleet settings merged from defaults, `batchfleet.toml`, and `BATCHFLEET_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BATCHFLEET",
    discovery(
        app_name = "batchfleet",
        env_var = "BATCHFLEET_CONFIG_PATH",
        config_file_name = "batchfleet.toml",
        dotfile_name = ".batchfleet.toml",
        project_file_name = "batchfleet.toml"
    )
)]
pub struct FleetConfig {
    /// Azure AD tenant owning the service principal.
    pub azure_tenant_id: String,
    /// Service principal application id.
    pub azure_client_id: String,
    /// Service principal secret.
    pub azure_client_secret: String,
    /// Subscription holding the batch accounts. Informational only.
    pub azure_subscription_id: Option<String>,
    /// Comma separated `name:location` pairs, one account per location.
    pub batch_accounts: String,
    /// Pool hosting server tasks.
    #[ortho_config(default = DEFAULT_RESOURCE_ID.to_owned())]
    pub pool_id: String,
    /// Job receiving server tasks.
    #[ortho_config(default = DEFAULT_RESOURCE_ID.to_owned())]
    pub job_id: String,
    /// VM size used when a pool has to be created.
    #[ortho_config(default = DEFAULT_VM_SIZE.to_owned())]
    pub vm_size: String,
    /// Bootstrap script fetched by each node's start task.
    #[ortho_config(default = DEFAULT_START_TASK_URL.to_owned())]
    pub start_task_url: String,
    /// Command run by each node's start task.
    #[ortho_config(default = DEFAULT_START_TASK_COMMAND.to_owned())]
    pub start_task_command: String,
    /// Command line dispatched for each provisioned server.
    #[ortho_config(default = DEFAULT_SERVER_COMMAND.to_owned())]
    pub server_command: String,
    /// Pause between assignment checks, in milliseconds.
    #[ortho_config(default = 500)]
    pub assignment_poll_interval_ms: u64,
    /// Budget for a task to be placed on a node, in seconds.
    #[ortho_config(default = 180)]
    pub assignment_timeout_secs: u64,
    /// Pause between completion checks, in milliseconds.
    #[ortho_config(default = 15_000)]
    pub completion_poll_interval_ms: u64,
    /// Budget for a task to complete, in seconds.
    #[ortho_config(default = 240)]
    pub completion_timeout_secs: u64,
    /// Age in seconds after which cached node details are refreshed.
    #[ortho_config(default = 600)]
    pub node_ttl_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to batchfleet.toml",
            self.env_var, self.toml_key
        )
    }
}

const REQUIRED_TEXT: [FieldMetadata; 8] = [
    FieldMetadata::new(
        "Azure tenant ID",
        "BATCHFLEET_AZURE_TENANT_ID",
        "azure_tenant_id",
    ),
    FieldMetadata::new(
        "Azure client ID",
        "BATCHFLEET_AZURE_CLIENT_ID",
        "azure_client_id",
    ),
    FieldMetadata::new(
        "Azure client secret",
        "BATCHFLEET_AZURE_CLIENT_SECRET",
        "azure_client_secret",
    ),
    FieldMetadata::new("pool ID", "BATCHFLEET_POOL_ID", "pool_id"),
    FieldMetadata::new("job ID", "BATCHFLEET_JOB_ID", "job_id"),
    FieldMetadata::new("VM size", "BATCHFLEET_VM_SIZE", "vm_size"),
    FieldMetadata::new(
        "start task command",
        "BATCHFLEET_START_TASK_COMMAND",
        "start_task_command",
    ),
    FieldMetadata::new(
        "server command",
        "BATCHFLEET_SERVER_COMMAND",
        "server_command",
    ),
];

const BATCH_ACCOUNTS: FieldMetadata = FieldMetadata::new(
    "batch accounts",
    "BATCHFLEET_BATCH_ACCOUNTS",
    "batch_accounts",
);

impl FleetConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("batchfleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn text_fields(&self) -> [&str; 8] {
        [
            &self.azure_tenant_id,
            &self.azure_client_id,
            &self.azure_client_secret,
            &self.pool_id,
            &self.job_id,
            &self.vm_size,
            &self.start_task_command,
            &self.server_command,
        ]
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for a blank required field,
    /// [`ConfigError::Accounts`] for an invalid account list, and
    /// [`ConfigError::ZeroDuration`] for a zero interval or timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in self.text_fields().into_iter().zip(&REQUIRED_TEXT) {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "missing {}: {}",
                    metadata.description,
                    metadata.hint()
                )));
            }
        }
        self.account_registry()?;

        let durations = [
            (self.assignment_poll_interval_ms, "assignment_poll_interval_ms"),
            (self.assignment_timeout_secs, "assignment_timeout_secs"),
            (self.completion_poll_interval_ms, "completion_poll_interval_ms"),
            (self.completion_timeout_secs, "completion_timeout_secs"),
        ];
        if let Some((_, key)) = durations.iter().find(|(value, _)| *value == 0) {
            return Err(ConfigError::ZeroDuration(*key));
        }
        Ok(())
    }

    /// Parses the configured account list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Accounts`] when the list is empty, malformed,
    /// or names a location twice.
    pub fn account_registry(&self) -> Result<AccountRegistry, ConfigError> {
        AccountRegistry::parse(&self.batch_accounts).map_err(|source| ConfigError::Accounts {
            hint: BATCH_ACCOUNTS.hint(),
            source,
        })
    }

    /// Service principal credentials.
    #[must_use]
    pub fn credentials(&self) -> AzureCredentials {
        AzureCredentials {
            tenant_id: self.azure_tenant_id.clone(),
            client_id: self.azure_client_id.clone(),
            client_secret: self.azure_client_secret.clone(),
        }
    }

    /// Resource names and time budgets for the orchestration layer.
    #[must_use]
    pub fn settings(&self) -> FleetSettings {
        FleetSettings {
            pool_id: self.pool_id.clone(),
            job_id: self.job_id.clone(),
            server_command: self.server_command.clone(),
            assignment_poll_interval: Duration::from_millis(self.assignment_poll_interval_ms),
            assignment_timeout: Duration::from_secs(self.assignment_timeout_secs),
            completion_poll_interval: Duration::from_millis(self.completion_poll_interval_ms),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            node_ttl: Duration::from_secs(self.node_ttl_secs),
        }
    }

    /// Pool template with the configured overrides applied.
    #[must_use]
    pub fn pool_template(&self) -> PoolTemplate {
        PoolTemplate {
            vm_size: self.vm_size.clone(),
            start_task_url: self.start_task_url.clone(),
            start_task_command: self.start_task_command.clone(),
            ..PoolTemplate::default()
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// The batch account list is invalid.
    #[error("invalid batch accounts ({hint}): {source}")]
    Accounts {
        /// How to supply the value.
        hint: String,
        /// Underlying parse failure.
        #[source]
        source: AccountError,
    },
    /// An interval or timeout was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
