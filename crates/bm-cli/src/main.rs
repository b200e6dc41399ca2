//! bridgeme CLI
//!
//! Single binary for both ends of a bridge:
//! - `host` shares the local shell through an SSH relay
//! - `connect` attaches the local terminal to a hosted session
//! - `status` / `close` manage the sessions of a running host process

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bm_core::config::{self, BridgeConfig};
use bridgeme::commands;
use bridgeme::output::print_error;

#[derive(Parser)]
#[command(name = "bridgeme")]
#[command(author, version, about = "Share a terminal session through an SSH relay")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "BRIDGEME_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share this machine's shell through a relay
    Host {
        /// Relay to bind on: [user@]host[:ssh_port]
        destination: String,
        /// Relay-side tunnel port (allocated from the configured range if omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Attach this terminal to a hosted session
    Connect {
        /// Connect string printed by the host: [user@]relay[:ssh_port]:port
        target: String,
    },

    /// Show the sessions of the running host process
    Status {
        /// Keep printing state changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Close a session of the running host process
    #[command(group(ArgGroup::new("which").required(true).args(["id", "all"])))]
    Close {
        /// Session ID to close
        id: Option<String>,
        /// Close every session
        #[arg(short, long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Raw-mode screens get garbled by chatty logs
    let attached = matches!(cli.command, Commands::Connect { .. });
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) if attached => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("{:#}", e));
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Commands::Host { destination, port } => {
            commands::host_command(config, &destination, port, cancel).await?;
        }

        Commands::Connect { target } => {
            commands::connect_command(config, &target, cancel).await?;
        }

        Commands::Status { watch } => {
            commands::status_command(&config.control.address(), watch, cancel).await?;
        }

        Commands::Close { id, all } => {
            commands::close_command(&config.control.address(), id.as_deref(), all).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    let config = config::resolve_config(path.map(PathBuf::as_path)).with_context(|| match path {
        Some(path) => format!("Failed to load config from {:?}", path),
        None => format!(
            "Failed to load config from {:?}",
            config::default_config_path()
        ),
    })?;
    tracing::debug!(?path, "Configuration loaded");
    Ok(config)
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel.cancel();
    });
}
