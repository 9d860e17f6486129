//! # ShellCraft Daemon Library
//!
//! This crate hosts one isolated shell workload per visitor and bridges a
//! browser terminal to it over WebSocket.
//!
//! ## Overview
//!
//! - **Session Registry**: concurrent store of sessions and their activity
//! - **Admission Control**: capacity ceiling checked before creation
//! - **Terminal Bridge**: full-duplex pump between a channel and a workload
//! - **Idle Reclaimer**: periodic eviction of sessions with no recent activity
//! - **Workload Runtime**: pluggable backend that creates and attaches workloads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │            HTTP Session Surface (axum)                   │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │        │                  │                    │                │
//! │  ┌───────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │ Admission │  │ Terminal Bridge  │  │  Idle Reclaimer  │      │
//! │  └───────────┘  └──────────────────┘  └──────────────────┘      │
//! │        │                  │                    │                │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                  Session Registry                        │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                           │                                     │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │        Workload Runtime (docker | pty | mock)            │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     let addr = orchestrator.start().await?;
//!     println!("listening on {addr}");
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session registry and admission control
//! - [`bridge`]: Terminal bridge and its channel abstraction
//! - [`reclaimer`]: Idle session reclamation
//! - [`runtime`]: Workload runtime trait and backends
//! - [`server`]: HTTP routes and the WebSocket adapter
//! - [`orchestrator`]: Main daemon coordinator

pub mod bridge;
pub mod config;
pub mod orchestrator;
pub mod reclaimer;
pub mod runtime;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    AdmissionController, AdmissionPolicy, Session, SessionError, SessionId, SessionRegistry,
};

pub use bridge::{BridgeConfig, BridgeSummary, EndReason, TerminalBridge};

pub use reclaimer::{IdleReclaimer, SweepReport};

pub use runtime::{DockerRuntime, MockRuntime, PtyRuntime, RuntimeError, WorkloadRuntime};

pub use server::{router, AppState};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
