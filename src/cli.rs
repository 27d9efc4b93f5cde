//! Command-line interface definitions for the control plane (§6.2).

use clap::{Parser, Subcommand};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the control plane against a config file.
    Run(RunArgs),
    /// Install a systemd unit for the process; prints a manual invocation on other platforms.
    Install(InstallArgs),
    /// Load and validate the config file, print a summary, exit without starting the server.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "ezfrontend.toml")]
        config: String,
    },
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "ezfrontend.toml")]
    pub config: String,
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    pub log_level: Option<String>,
    /// Overrides `server.external_hostname`.
    #[arg(long)]
    pub external_hostname: Option<String>,
    /// Overrides `server.internal_hostname`.
    #[arg(long)]
    pub internal_hostname: Option<String>,
    /// Overrides `rpc.port`, must be in `[1,65535]`.
    #[arg(long)]
    pub port: Option<u16>,
    /// Overrides `server.ngx_workers`; defaults to logical CPU count, minimum 2.
    #[arg(long)]
    pub ngx_workers: Option<u32>,
}

#[derive(Debug, Parser)]
pub struct InstallArgs {
    /// Path to the configuration file the installed service should run with.
    #[arg(short, long, default_value = "ezfrontend.toml")]
    pub config: String,
}
