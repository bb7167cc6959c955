//! Command-line interface definitions for the `batchfleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `batchfleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "batchfleet",
    about = "Provision game servers on Azure Batch pools and report their addresses",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a server in a region and print its public address.
    #[command(
        name = "provision",
        about = "Provision a server in a region and print its public address"
    )]
    Provision(ProvisionCommand),
    /// Run a command on a node in a region and print its output.
    #[command(name = "exec", about = "Run a command on a node and print its output")]
    Exec(ExecCommand),
    /// List the nodes of every configured account.
    #[command(name = "nodes", about = "List the nodes of every configured account")]
    Nodes,
}

/// Arguments for the `batchfleet provision` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Location of the batch account to use (for example `westeurope`).
    #[arg(long, value_name = "LOCATION")]
    pub(crate) region: String,
}

/// Arguments for the `batchfleet exec` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    /// Location of the batch account to use.
    #[arg(long, value_name = "LOCATION")]
    pub(crate) region: String,
    /// Command to execute on the node (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
