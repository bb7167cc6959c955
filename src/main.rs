//! Binary entry point for the batchfleet CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use batchfleet::{
    BatchError, FleetConfig, OrchestrationFacade, ProvisionError, RestBatchService, dispatch::shell_command,
};

mod cli;

use cli::{Cli, ExecCommand, ProvisionCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to render output: {0}")]
    Output(String),
    #[error("failed to initialise the batch client: {0}")]
    Client(#[from] BatchError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Provision(args) => provision(args).await,
        Cli::Exec(args) => exec(args).await,
        Cli::Nodes => nodes().await,
    }
}

fn build_facade() -> Result<OrchestrationFacade<RestBatchService>, CliError> {
    let config =
        FleetConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let registry = config
        .account_registry()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let service = Arc::new(RestBatchService::new(config.credentials())?);
    Ok(OrchestrationFacade::new(
        service,
        registry,
        config.settings(),
        config.pool_template(),
    ))
}

async fn provision(args: ProvisionCommand) -> Result<(), CliError> {
    let facade = build_facade()?;
    let address = facade.provision(&args.region).await?;
    write_json(&address)
}

async fn exec(args: ExecCommand) -> Result<(), CliError> {
    validate_command_args(&args.command)?;
    let facade = build_facade()?;
    let command_line = shell_command(&render_remote_command(&args.command));
    let output = facade.run_command(&args.region, &command_line).await?;
    write!(io::stdout(), "{output}").map_err(|err| CliError::Output(err.to_string()))
}

async fn nodes() -> Result<(), CliError> {
    let facade = build_facade()?;
    let nodes = facade.inventory().await;
    write_json(&nodes)
}

fn write_json(value: &impl Serialize) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    if let CliError::Provision(inner) = err {
        error!(kind = ?inner.kind(), "request failed");
    }
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
