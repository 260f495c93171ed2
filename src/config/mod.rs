//! Configuration Module
//!
//! Provides TOML-based configuration for indexrelay with support for:
//! - Logging
//! - Cluster membership and replication
//! - Outbox processing (retry budget, batch size, polling)
//! - Multi-tenancy
//! - Indexes hosted by the local backend
//! - Environment variable overrides (INDEXRELAY__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::codec::MAX_INDEX_NAME_LEN;

// Re-export cluster config types
pub use cluster::ClusterConfig;

// Re-export outbox config types
pub use outbox::{OutboxConfig, TenancyConfig};

mod cluster;
mod outbox;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Outbox configuration
    pub outbox: OutboxConfig,
    /// Multi-tenancy configuration
    pub tenancy: TenancyConfig,
    /// Locally hosted indexes
    pub index: IndexConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
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

/// Indexes served by the local backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub names: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `INDEXRELAY__` prefix with double underscores for nesting:
    ///    - `INDEXRELAY__OUTBOX__MAX_RETRIES=5` overrides `outbox.max_retries`
    ///    - `INDEXRELAY__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    ///    - `INDEXRELAY__OUTBOX__RETRY_DELAY=30s` overrides `outbox.retry_delay`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("cluster.enabled", false)?
            .set_default("outbox.enabled", true)?
            .set_default("tenancy.enabled", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (INDEXRELAY__OUTBOX__PATH, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("INDEXRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.partitions == 0 {
            return Err(ConfigError::Validation(
                "outbox.partitions must be at least 1".to_string(),
            ));
        }

        if self.outbox.poll_batch_size == 0 {
            return Err(ConfigError::Validation(
                "outbox.poll_batch_size must be at least 1".to_string(),
            ));
        }

        if self.tenancy.enabled {
            if self.tenancy.tenant_ids.is_empty() {
                return Err(ConfigError::Validation(
                    "tenancy.tenant_ids must not be empty when tenancy is enabled".to_string(),
                ));
            }
            if self.tenancy.tenant_ids.iter().any(|id| id.is_empty()) {
                return Err(ConfigError::Validation(
                    "tenancy.tenant_ids must not contain empty identifiers".to_string(),
                ));
            }
        }

        if let Some(name) = self
            .index
            .names
            .iter()
            .find(|n| n.len() > MAX_INDEX_NAME_LEN)
        {
            let prefix: String = name.chars().take(32).collect();
            return Err(ConfigError::Validation(format!(
                "index name '{}...' exceeds {} bytes",
                prefix, MAX_INDEX_NAME_LEN
            )));
        }

        if let Some(node_id) = &self.cluster.node_id {
            if node_id.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.node_id must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
