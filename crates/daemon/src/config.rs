//! Configuration management for the RemoVault daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/removault/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_clients must be between 1 and 1000, got {0}")]
    InvalidMaxClients(usize),

    #[error("max_users must be between 1 and 1024, got {0}")]
    InvalidMaxUsers(usize),

    #[error("max_transfers must be between 1 and 1024, got {0}")]
    InvalidMaxTransfers(usize),

    #[error("transfer_wait_secs must be at most 3600, got {0}")]
    InvalidTransferWait(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the RemoVault daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Client-facing server configuration.
    pub server: ServerConfig,

    /// Broker connection configuration.
    pub broker: BrokerConfig,

    /// Storage layout configuration.
    pub storage: StorageConfig,

    /// Shared registry limits.
    pub registry: RegistryConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Client-facing server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the control listener on.
    pub bind_addr: String,

    /// TCP port for the control listener (0 picks an ephemeral port).
    pub port: u16,

    /// Maximum number of concurrent client connections.
    pub max_clients: usize,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path of the broker's Unix socket.
    pub socket_path: PathBuf,

    /// Timeout in seconds for a single broker request.
    pub request_timeout_secs: u64,
}

/// Storage layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root containing the per-user home directories.
    ///
    /// Must match the broker's `--root`.
    pub root: PathBuf,
}

/// Shared registry limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of simultaneously online users.
    pub max_users: usize,

    /// Maximum number of pending transfer tickets.
    pub max_transfers: usize,

    /// How long a transfer request waits for the receiver to come online,
    /// in seconds.
    pub transfer_wait_secs: u64,
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
            bind_addr: "0.0.0.0".to_string(),
            port: 9090,
            max_clients: 64,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/removault/broker.sock"),
            request_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/srv/removault"),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_users: 20,
            max_transfers: 20,
            transfer_wait_secs: 30,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("removault")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - REMOVAULT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - REMOVAULT_PORT: Override the control listener port
    /// - REMOVAULT_BROKER_SOCKET: Override the broker socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("REMOVAULT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(port) = std::env::var("REMOVAULT_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                tracing::info!("Overriding port from environment: {}", port);
                self.server.port = port;
            } else if !port.is_empty() {
                tracing::warn!("Ignoring non-numeric REMOVAULT_PORT: {}", port);
            }
        }

        if let Ok(socket) = std::env::var("REMOVAULT_BROKER_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding broker socket from environment: {}", socket);
                self.broker.socket_path = PathBuf::from(socket);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_clients < 1 || self.server.max_clients > 1000 {
            return Err(ConfigError::InvalidMaxClients(self.server.max_clients));
        }

        if self.registry.max_users < 1 || self.registry.max_users > 1024 {
            return Err(ConfigError::InvalidMaxUsers(self.registry.max_users));
        }

        if self.registry.max_transfers < 1 || self.registry.max_transfers > 1024 {
            return Err(ConfigError::InvalidMaxTransfers(self.registry.max_transfers));
        }

        if self.registry.transfer_wait_secs > 3600 {
            return Err(ConfigError::InvalidTransferWait(
                self.registry.transfer_wait_secs,
            ));
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
            tracing::debug!("Config file not found at {:?}, using defaults", path);
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

        tracing::debug!("Configuration saved to {:?}", path);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.max_clients, 64);
        assert_eq!(
            config.broker.socket_path,
            PathBuf::from("/run/removault/broker.sock")
        );
        assert_eq!(config.storage.root, PathBuf::from("/srv/removault"));
        assert_eq!(config.registry.max_users, 20);
        assert_eq!(config.registry.max_transfers, 20);
        assert_eq!(config.registry.transfer_wait_secs, 30);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[server]
port = 7070
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.port, 7070);
        // Other values should be defaults
        assert_eq!(config.server.max_clients, 64);
        assert_eq!(config.registry.max_users, 20);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[server]
bind_addr = "127.0.0.1"
port = 7171
max_clients = 10

[broker]
socket_path = "/tmp/broker.sock"
request_timeout_secs = 5

[storage]
root = "/data/vault"

[registry]
max_users = 5
max_transfers = 8
transfer_wait_secs = 10
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 7171);
        assert_eq!(config.server.max_clients, 10);
        assert_eq!(config.broker.socket_path, PathBuf::from("/tmp/broker.sock"));
        assert_eq!(config.broker.request_timeout_secs, 5);
        assert_eq!(config.storage.root, PathBuf::from("/data/vault"));
        assert_eq!(config.registry.max_users, 5);
        assert_eq!(config.registry.max_transfers, 8);
        assert_eq!(config.registry.transfer_wait_secs, 10);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
port = 7070
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[server]
port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml_contains_sections() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[broker]"));
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("[registry]"));
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.server.port = 4242;
        original.registry.max_transfers = 3;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.server.max_clients = 5;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir
            .path()
            .join("nested")
            .join("dirs")
            .join("config.toml");

        Config::default().save(&config_path).unwrap();
        assert!(config_path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("removault"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_clients_bounds() {
        let mut config = Config::default();

        config.server.max_clients = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxClients(0)));

        config.server.max_clients = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxClients(1001)));

        config.server.max_clients = 1;
        assert!(config.validate().is_ok());

        config.server.max_clients = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_registry_bounds() {
        let mut config = Config::default();

        config.registry.max_users = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxUsers(0)));
        config.registry.max_users = 20;

        config.registry.max_transfers = 2000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxTransfers(2000))
        );
        config.registry.max_transfers = 20;

        config.registry.transfer_wait_secs = 3601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTransferWait(3601))
        );

        // Zero wait is valid: the request fails immediately if the receiver
        // is offline
        config.registry.transfer_wait_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();

        for level in ["trace", "debug", "info", "warn", "error", "WARN", "Info"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.daemon.log_level = String::new();
        assert!(config.validate().is_err());
    }
}
