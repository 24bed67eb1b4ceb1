//! Configuration file parsing
//!
//! Parses TOML configuration files for the cache server. Every field has a
//! default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Pull-through origin settings
    #[serde(default)]
    pub origin: OriginConfig,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// TCP port; 0 picks an ephemeral port
    pub port: u16,

    /// Root of the artifact tree
    pub storage_root: PathBuf,

    /// Log level (trace, debug, info, warn, error, off)
    pub log_level: String,

    /// In-memory hot tier budget in bytes; 0 disables it
    pub hot_tier_capacity: u64,

    /// Shared secret granting write access
    pub secret: String,

    /// Serve clients with a wrong secret read-only instead of dropping them
    pub allow_unsafe_reads: bool,

    /// Answer every get with a synthetic body and discard every put
    pub dry_run: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9966,
            storage_root: PathBuf::from("cache"),
            log_level: "info".to_string(),
            hot_tier_capacity: 0,
            secret: "artifact-cache".to_string(),
            allow_unsafe_reads: true,
            dry_run: false,
        }
    }
}

impl ServerConfig {
    /// `bind:port` for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Pull-through origin settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Whole-request timeout in seconds; unset waits indefinitely
    pub timeout_secs: Option<u64>,
}

impl OriginConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl Config {
    /// Load configuration from a file.
    ///
    /// Not validated, so callers can layer overrides first and then call
    /// [`Config::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Parse and validate configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.secret.is_empty() {
            return Err(ConfigError::Invalid("server.secret must not be empty".to_string()));
        }
        if server.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "server.storage_root must not be empty".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&server.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level {:?} (expected one of {})",
                server.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.origin.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "origin.timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 9966);
        assert_eq!(config.server.hot_tier_capacity, 0);
        assert!(config.server.allow_unsafe_reads);
        assert!(!config.server.dry_run);
        assert_eq!(config.origin.timeout(), None);
        assert_eq!(config.server.listen_addr(), "0.0.0.0:9966");
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[server]
bind = "127.0.0.1"
port = 7000
storage_root = "/srv/cache"
log_level = "debug"
hot_tier_capacity = 268435456
secret = "s3cret"
allow_unsafe_reads = false

[origin]
timeout_secs = 30
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.server.listen_addr(), "127.0.0.1:7000");
        assert_eq!(config.server.storage_root, PathBuf::from("/srv/cache"));
        assert_eq!(config.server.hot_tier_capacity, 256 << 20);
        assert_eq!(config.server.secret, "s3cret");
        assert!(!config.server.allow_unsafe_reads);
        assert_eq!(config.origin.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_empty_secret_error() {
        let result = Config::parse("[server]\nsecret = \"\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_log_level_error() {
        let result = Config::parse("[server]\nlog_level = \"chatty\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_defers_validation() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("cache.toml");
        std::fs::write(&path, "[server]\nsecret = \"\"\n").unwrap();

        let mut config = Config::load(&path).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.server.secret = "from-cli".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_type_error() {
        let result = Config::parse("[server]\nport = \"nine\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
