//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sandcastle sandbox control plane
#[derive(Parser, Debug)]
#[command(name = "sandcastle")]
#[command(version, about = "Sandcastle sandbox control plane")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// YAML configuration file; built-in defaults are used when omitted
    #[arg(short, long, env = "SANDCASTLE_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Raise log verbosity above the configured level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the control plane until interrupted
    Serve,

    /// Print the current status of every sandbox container as JSON and exit
    Sync,

    /// Validate the configuration and print the effective settings as JSON
    Config,
}
