//! Configuration management for the ShellCraft daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellcraft/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::AdmissionPolicy;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("idle_timeout_secs must be greater than 0, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("cleanup_interval_secs must be greater than 0, got {0}")]
    InvalidCleanupInterval(u64),

    #[error("heartbeat_interval_secs must be greater than 0, got {0}")]
    InvalidHeartbeatInterval(u64),

    #[error("heartbeat_timeout_secs must be between 1 and heartbeat_interval_secs, got {0}")]
    InvalidHeartbeatTimeout(u64),

    #[error("read_buffer_size must be at least 4096 bytes, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("default_image must not be empty")]
    EmptyDefaultImage,

    #[error("docker CLI not found: {0}")]
    DockerNotFound(String),

    #[error("image {image} maps to a command that does not exist: {command}")]
    InvalidImageCommand { image: String, command: String },

    #[error("default_image {0} has no entry in runtime.images")]
    UnmappedDefaultImage(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Smallest accepted read chunk for the outbound pump.
pub const MIN_READ_BUFFER_SIZE: usize = 4096;

/// Main configuration structure for the ShellCraft daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Session capacity and reclamation.
    pub session: SessionConfig,

    /// Terminal bridge tuning.
    pub terminal: TerminalConfig,

    /// Workload runtime backend.
    pub runtime: RuntimeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// Listening port. `0` picks an ephemeral port.
    pub port: u16,
}

/// Session capacity and reclamation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// How strictly `max_sessions` is enforced.
    pub admission: AdmissionPolicy,

    /// Sessions without activity for this long are reclaimed.
    pub idle_timeout_secs: u64,

    /// Period of the idle reclamation sweep.
    pub cleanup_interval_secs: u64,

    /// Image used when a create request names none.
    pub default_image: String,
}

/// Terminal bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub heartbeat_interval_secs: u64,

    /// Deadline for a single liveness probe.
    pub heartbeat_timeout_secs: u64,

    /// Chunk size for reads from the workload output.
    pub read_buffer_size: usize,

    /// Pause between starting a workload and attaching to it.
    pub attach_delay_ms: u64,

    /// Send a welcome banner when a terminal connects.
    pub welcome_banner: bool,
}

/// Available workload runtime backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// Docker containers.
    #[default]
    Docker,
    /// Local pseudo-terminal processes, for images listed in `images`.
    Pty,
    /// In-memory echo workloads.
    Mock,
}

/// Workload runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,

    /// Docker CLI used by the docker backend.
    pub docker: String,

    /// Image name to local command line, for the pty backend. Images
    /// without an entry cannot be created there.
    pub images: BTreeMap<String, String>,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// How long `stop` waits for a killed workload to exit.
    pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 4242,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 40,
            admission: AdmissionPolicy::default(),
            idle_timeout_secs: 15 * 60,
            cleanup_interval_secs: 5 * 60,
            default_image: "alpine:latest".to_string(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            read_buffer_size: 8192,
            attach_delay_ms: 100,
            welcome_banner: true,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::default(),
            docker: "docker".to_string(),
            images: BTreeMap::new(),
            cols: 80,
            rows: 24,
            stop_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellcraft")
        .join("config.toml")
}

/// Whether the program at the head of `command` exists, by path or on `PATH`.
fn program_exists(command: &str) -> bool {
    let program = command.split_whitespace().next().unwrap_or_default();
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        !program.is_empty() && which::which(program).is_ok()
    }
}

/// Reads a non-empty environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORT: listening port
    /// - SHELLCRAFT_IMAGE: default workload image
    /// - SHELLCRAFT_LOG_LEVEL: log level (trace, debug, info, warn, error)
    /// - SHELLCRAFT_MAX_SESSIONS: session capacity
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_override("PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!(port, "Overriding port from environment");
                    self.server.port = port;
                }
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }

        if let Some(image) = env_override("SHELLCRAFT_IMAGE") {
            tracing::info!(image = %image, "Overriding default_image from environment");
            self.session.default_image = image;
        }

        if let Some(level) = env_override("SHELLCRAFT_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(max) = env_override("SHELLCRAFT_MAX_SESSIONS") {
            match max.parse::<usize>() {
                Ok(max) => {
                    tracing::info!(max_sessions = max, "Overriding max_sessions from environment");
                    self.session.max_sessions = max;
                }
                Err(_) => tracing::warn!(value = %max, "Ignoring invalid SHELLCRAFT_MAX_SESSIONS"),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if !(1..=1000).contains(&session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout(session.idle_timeout_secs));
        }
        if session.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidCleanupInterval(
                session.cleanup_interval_secs,
            ));
        }
        if session.default_image.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultImage);
        }

        let terminal = &self.terminal;
        if terminal.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(
                terminal.heartbeat_interval_secs,
            ));
        }
        if terminal.heartbeat_timeout_secs == 0
            || terminal.heartbeat_timeout_secs > terminal.heartbeat_interval_secs
        {
            return Err(ConfigError::InvalidHeartbeatTimeout(
                terminal.heartbeat_timeout_secs,
            ));
        }
        if terminal.read_buffer_size < MIN_READ_BUFFER_SIZE {
            return Err(ConfigError::InvalidReadBufferSize(terminal.read_buffer_size));
        }

        let runtime = &self.runtime;
        if runtime.cols == 0 || runtime.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: runtime.cols,
                rows: runtime.rows,
            });
        }

        match runtime.backend {
            RuntimeBackend::Docker => {
                if !program_exists(&runtime.docker) {
                    return Err(ConfigError::DockerNotFound(runtime.docker.clone()));
                }
            }
            RuntimeBackend::Pty => {
                if !runtime.images.contains_key(&session.default_image) {
                    return Err(ConfigError::UnmappedDefaultImage(
                        session.default_image.clone(),
                    ));
                }
                for (image, command) in &runtime.images {
                    if !program_exists(command) {
                        return Err(ConfigError::InvalidImageCommand {
                            image: image.clone(),
                            command: command.clone(),
                        });
                    }
                }
            }
            RuntimeBackend::Mock => {}
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
