//! Configuration module for the linechat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::SessionConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "linechat")]
#[command(author = "linechat authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP text server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Client inactivity timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Directory for per-client transcript files
    #[arg(long)]
    pub transcript_dir: Option<PathBuf>,

    /// Maximum bytes buffered while waiting for a line terminator
    #[arg(long)]
    pub max_line: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

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
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Idle timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            max_line_length: default_max_line_length(),
            workers: None,
        }
    }
}

/// Transcript-related configuration
#[derive(Debug, Deserialize)]
pub struct TranscriptConfig {
    #[serde(default = "default_transcript_dir")]
    pub dir: PathBuf,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: default_transcript_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    4000
}

fn default_timeout() -> u64 {
    30
}

fn default_max_line_length() -> usize {
    1024
}

fn default_transcript_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub max_line_length: usize,
    pub transcript_dir: PathBuf,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            idle_timeout_secs: cli.timeout.unwrap_or(toml_config.server.timeout),
            max_line_length: cli
                .max_line
                .unwrap_or(toml_config.server.max_line_length),
            transcript_dir: cli
                .transcript_dir
                .unwrap_or(toml_config.transcript.dir),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout", "must be at least 1 second"));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid("max_line_length", "must be non-zero"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers", "must be non-zero"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Settings handed to every session.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_line_length: self.max_line_length,
            ..SessionConfig::default()
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid value for '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
