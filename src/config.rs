//! Configuration module for the shell server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::DEFAULT_READ_SIZE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the shell server
#[derive(Parser, Debug)]
#[command(name = "shell-gate")]
#[command(author = "shell-gate authors")]
#[command(version = "0.1.0")]
#[command(about = "Interactive shell server over telnet and WebSocket", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address for the line-oriented console (e.g., 127.0.0.1:17001)
    #[arg(short = 'p', long)]
    pub console: Option<String>,

    /// Address for the WebSocket shell (e.g., 127.0.0.1:18080)
    #[arg(short = 'w', long)]
    pub websocket: Option<String>,

    /// Do not open the WebSocket listener
    #[arg(long)]
    pub no_websocket: bool,

    /// Maximum number of simultaneous connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Shell prompt for console connections
    #[arg(long)]
    pub prompt: Option<String>,

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
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Console (telnet/netcat) listen address
    #[serde(default = "default_console")]
    pub console: String,
    /// WebSocket listen address; empty disables it
    #[serde(default = "default_websocket")]
    pub websocket: String,
    /// Connection limit across both listeners
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bytes requested per socket read
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            console: default_console(),
            websocket: default_websocket(),
            max_connections: default_max_connections(),
            read_buffer: default_read_buffer(),
        }
    }
}

/// Shell configuration
#[derive(Debug, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
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

fn default_console() -> String {
    "127.0.0.1:17001".to_string()
}

fn default_websocket() -> String {
    "127.0.0.1:18080".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_buffer() -> usize {
    DEFAULT_READ_SIZE
}

fn default_prompt() -> String {
    "shell> ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub console: String,
    pub websocket: Option<String>,
    pub max_connections: usize,
    pub read_buffer: usize,
    pub prompt: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let websocket = if cli.no_websocket {
            None
        } else {
            Some(cli.websocket.unwrap_or(toml_config.server.websocket)).filter(|a| !a.is_empty())
        };

        Config {
            console: cli.console.unwrap_or(toml_config.server.console),
            websocket,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            read_buffer: toml_config.server.read_buffer.max(1),
            prompt: cli.prompt.unwrap_or(toml_config.shell.prompt),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
