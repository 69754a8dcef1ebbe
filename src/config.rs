//! Configuration module for the frameshift server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "frameshift")]
#[command(author = "frameshift authors")]
#[command(version = "0.1.0")]
#[command(about = "A streaming server for caret-framed byte shifting", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9090)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrently served connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-connection read buffer size in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Idle timeout for a single read or write in seconds (0 = none)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of live sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog passed to the socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Read buffer capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds a single read or write may stall (0 = forever)
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub backlog: i32,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen}'")))?;

        let idle_timeout = cli
            .idle_timeout
            .unwrap_or(toml_config.session.idle_timeout);

        let config = Config {
            listen,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.session.buffer_size),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be non-zero".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be non-zero".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
