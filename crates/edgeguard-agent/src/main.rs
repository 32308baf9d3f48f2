//! EdgeGuard endpoint agent daemon.
//!
//! Thin process wrapper around the core supervisor: parse flags, load or
//! build the configuration, install logging, wire OS signals to the
//! shutdown handle, and map the outcome to an exit code. Startup errors go
//! to stderr; everything after logging is installed goes to the
//! application log.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use edgeguard_agent_core::agent::Supervisor;
use edgeguard_agent_core::config::{self, Config, ConfigError};
use edgeguard_agent_core::logging::{self, LogConfig};

#[derive(Parser)]
#[command(
    name = "edgeguard-agent",
    version = edgeguard_agent_core::AGENT_VERSION,
    about = "EdgeGuard enterprise endpoint agent"
)]
struct Cli {
    /// Path to the configuration file (default: AGENT_CONFIG or the
    /// platform location)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = config::config_path(cli.config);

    // A missing config file means first run: bootstrap from environment.
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(ConfigError::NotFound) => Config::from_environment(),
        Err(e) => {
            eprintln!("edgeguard-agent: failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_handle = match logging::init(&LogConfig {
        path: config.log_file.clone(),
        level: config.log_level,
        max_size_mb: config.log_max_size_mb,
        max_backups: config.log_max_backups,
    }) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("edgeguard-agent: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut supervisor = match Supervisor::new(config, config_path) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("edgeguard-agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    spawn_signal_handlers(&supervisor);

    let code = match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("agent stopped with error: {e}");
            eprintln!("edgeguard-agent: {e}");
            ExitCode::FAILURE
        }
    };

    log_handle.flush();
    code
}

fn spawn_signal_handlers(supervisor: &Supervisor) {
    let handle = supervisor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            handle.shutdown();
        }
    });

    #[cfg(unix)]
    {
        let handle = supervisor.handle();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            if sigterm.recv().await.is_some() {
                tracing::info!("received SIGTERM, shutting down");
                handle.shutdown();
            }
        });
    }
}
