//! Configuration module for the command server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::Limits;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Reactor adapter driving connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness-based worker threads over mio (epoll/kqueue)
    #[default]
    Mio,
    /// One tokio task per connection
    Tokio,
}

/// Command-line arguments for the command server
#[derive(Parser, Debug)]
#[command(name = "cmdserver")]
#[command(author = "cmdserver authors")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven ping/cat/sum command server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Reactor adapter to run
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Connections accepted per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection engine configuration
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// File bytes read per writable turn
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Longest partial command line kept before rejecting it
    #[serde(default = "default_max_line")]
    pub max_line: usize,
    /// Buffered input allowed per connection
    #[serde(default = "default_max_input")]
    pub max_input: usize,
    /// Engine steps per writable turn before yielding to other connections
    #[serde(default = "default_write_budget")]
    pub write_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_line: default_max_line(),
            max_input: default_max_input(),
            write_budget: default_write_budget(),
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
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    256
}

fn default_max_line() -> usize {
    64 * 1024
}

fn default_max_input() -> usize {
    1024 * 1024
}

fn default_write_budget() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// Worker threads; 0 means one per CPU core.
    pub workers: usize,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub chunk_size: usize,
    pub max_line: usize,
    pub max_input: usize,
    pub write_budget: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
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
        let engine = toml_config.engine;
        if engine.chunk_size == 0 {
            return Err(ConfigError::Invalid("engine.chunk_size must be non-zero"));
        }
        if engine.write_budget == 0 {
            return Err(ConfigError::Invalid("engine.write_budget must be non-zero"));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            max_connections: toml_config.server.max_connections,
            chunk_size: engine.chunk_size,
            max_line: engine.max_line,
            max_input: engine.max_input,
            write_budget: engine.write_budget,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Per-connection limits handed to every new connection.
    pub fn limits(&self) -> Limits {
        Limits {
            chunk_size: self.chunk_size,
            max_line: self.max_line,
            max_input: self.max_input,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
