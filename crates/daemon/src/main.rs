//! ShellCraft Daemon
//!
//! Serves one isolated shell workload per visitor over HTTP and WebSocket.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use daemon::config::{Config, RuntimeBackend};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_subscriber::EnvFilter;

/// ShellCraft daemon - per-visitor shell sessions.
#[derive(Parser, Debug)]
#[command(name = "shellcraft")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until SIGINT/SIGTERM
    Start {
        /// Port to listen on (overrides config and PORT)
        #[arg(long, short)]
        port: Option<u16>,

        /// Workload runtime backend
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Workload runtime selectable from the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// Docker containers
    Docker,
    /// Mapped local commands on pseudo-terminals
    Pty,
    /// In-memory echo workloads
    Mock,
}

impl From<BackendArg> for RuntimeBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Docker => RuntimeBackend::Docker,
            BackendArg::Pty => RuntimeBackend::Pty,
            BackendArg::Mock => RuntimeBackend::Mock,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    init_tracing(cli.verbose, &config.daemon.log_level);
    if let Some(path) = &cli.config {
        tracing::info!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Start { port, backend } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(backend) = backend {
                config.runtime.backend = backend.into();
            }
            config.validate()?;

            let orchestrator = DaemonOrchestrator::new(config)?;
            run(&orchestrator).await?;
        }
        Commands::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// `--verbose` wins, then `RUST_LOG`, then the configured level.
fn init_tracing(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Runs the daemon until a shutdown signal arrives.
async fn run(orchestrator: &DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!(state = ?state, "Orchestrator state");
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!(addr = %addr, "Accepting sessions");
                }
                OrchestratorEvent::Drained {
                    destroyed,
                    teardown_failures,
                } => {
                    tracing::info!(destroyed, teardown_failures, "Sessions drained");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    let signal = wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    signal
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["shellcraft", "start"]).unwrap();
        match cli.command {
            Commands::Start { port, backend } => {
                assert!(port.is_none());
                assert!(backend.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_overrides() {
        let cli =
            Cli::try_parse_from(["shellcraft", "start", "--port", "8080", "--backend", "mock"])
                .unwrap();
        match cli.command {
            Commands::Start { port, backend } => {
                assert_eq!(port, Some(8080));
                assert_eq!(backend, Some(BackendArg::Mock));
                assert_eq!(RuntimeBackend::from(BackendArg::Mock), RuntimeBackend::Mock);
                assert_eq!(RuntimeBackend::from(BackendArg::Docker), RuntimeBackend::Docker);
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_rejects_bad_port() {
        assert!(Cli::try_parse_from(["shellcraft", "start", "--port", "99999"]).is_err());
        assert!(Cli::try_parse_from(["shellcraft", "start", "--backend", "vm"]).is_err());
    }

    #[test]
    fn test_config_command_with_global_flags() {
        let cli =
            Cli::try_parse_from(["shellcraft", "config", "--config", "/tmp/x.toml", "-v"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["shellcraft"]).is_err());
    }
}
