//! Broker configuration and limits.
//!
//! Supports configuration from:
//! - TOML file (default: `embermq.toml`)
//! - Environment variables with `EMBERMQ__` prefix (double underscore for
//!   nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `EMBERMQ__SERVER__BIND=0.0.0.0:1884`
//! - `EMBERMQ__LIMITS__MAX_PACKET_SIZE=2097152`
//! - `EMBERMQ__LOG__LEVEL=debug`

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// MQTT protocol maximum packet size, also the default limit.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 268_435_455;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100_000;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    pattern
        .replace_all(content, |caps: &regex::Captures| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                // Unset or non-unicode falls back to the inline default
                Err(_) => caps
                    .get(2)
                    .map(|default| default.as_str().to_string())
                    .unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1883".parse().unwrap()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes, fixed header included. Larger
    /// packets close the connection.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from a file (if it exists) plus environment
    /// variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        // Override with environment variables (EMBERMQ__SERVER__BIND, etc.)
        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    #[allow(dead_code)]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string (for testing).
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // MQTT protocol maximum is 268,435,455 bytes
        if self.limits.max_packet_size > DEFAULT_MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(
                "max_packet_size cannot exceed MQTT protocol maximum (268,435,455)".into(),
            ));
        }

        // A packet needs at least a fixed header
        if self.limits.max_packet_size < 2 {
            return Err(ConfigError::Validation(
                "max_packet_size must be at least 2".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
