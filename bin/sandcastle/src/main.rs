//! Sandcastle -- control plane daemon for sandboxed agent environments.
//!
//! `serve` runs the resource managers until interrupted, `sync` prints the
//! current sandbox container state, and `config` shows the effective
//! configuration.

mod cli;
mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use sandcastle_agent::{connect_default_runtime, SandcastleConfig};
use sandcastle_observability::{init_observability, LogLevel};
use std::process::ExitCode;

use cli::{Cli, Commands};
use daemon::ControlPlane;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if matches!(cli.command, Commands::Config) {
        return match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    apply_verbosity(&mut config, cli.verbose);

    // Initialize observability - hold the guard for application lifetime
    let (_guard, metrics) = match init_observability(&config.observability)
        .context("Failed to initialize observability")
    {
        Ok(init) => init,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Serve => {
                let container_runtime = connect_default_runtime()
                    .await
                    .context("Failed to connect to the container runtime")?;
                ControlPlane::new(config, container_runtime, metrics)
                    .serve(daemon::shutdown_signal())
                    .await
            }
            Commands::Sync => sync(config).await,
            Commands::Config => Ok(()),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Sandcastle exited with an error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<SandcastleConfig> {
    match &cli.config {
        Some(path) => SandcastleConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SandcastleConfig::default()),
    }
}

/// `-v` flags only ever make logging more verbose than configured
fn apply_verbosity(config: &mut SandcastleConfig, verbose: u8) {
    let requested = match verbose {
        0 => return,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    let logging = &mut config.observability.logging;
    if verbosity_rank(requested) > verbosity_rank(logging.level) {
        logging.level = requested;
    }
}

fn verbosity_rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Error => 0,
        LogLevel::Warn => 1,
        LogLevel::Info => 2,
        LogLevel::Debug => 3,
        LogLevel::Trace => 4,
    }
}

async fn sync(config: SandcastleConfig) -> Result<()> {
    let runtime = connect_default_runtime()
        .await
        .context("Failed to connect to the container runtime")?;
    let monitor = sandcastle_agent::ContainerEventMonitor::new(runtime, config.monitor);

    let mut changes = monitor
        .snapshot()
        .await
        .context("Failed to list sandbox containers")?;
    changes.sort_by(|a, b| a.container_id.cmp(&b.container_id));

    println!("{}", serde_json::to_string_pretty(&changes)?);
    Ok(())
}
