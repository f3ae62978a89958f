//! Configuration loading for salty-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).

use serde::Deserialize;
use std::path::PathBuf;

use salty_types::SUBPROTOCOL_V1;

/// Root configuration for salty-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Permanent key files.
    #[serde(default)]
    pub keys: KeysConfig,
    /// Worker pool configuration.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Connection limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:8765).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Supported subprotocols, most preferred first.
    #[serde(default = "default_subprotocols")]
    pub subprotocols: Vec<String>,
}

/// Permanent key configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    /// Files holding hex-encoded permanent secret keys. The first one is
    /// used for clients that do not ask for a specific key.
    #[serde(default)]
    pub permanent: Vec<PathBuf>,
}

/// What to do with work submitted while the pool is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a free slot (backpressure on the connection).
    #[default]
    Block,
    /// Reject the work; the connection is closed with 3002.
    Drop,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Jobs running at once (default: 8).
    #[serde(default = "default_workers")]
    pub size: usize,
    /// Jobs that may wait beyond the running ones (default: 1024).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Saturation policy (default: block).
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Seconds a connection may take to authenticate (default: 10).
    /// Slower connections are closed with 3008.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Largest WebSocket message accepted, in bytes (default: 64 KiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_subprotocols() -> Vec<String> {
    vec![SUBPROTOCOL_V1.to_string()]
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KiB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            subprotocols: default_subprotocols(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            size: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.size == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.size",
                reason: "must be at least 1".into(),
            });
        }
        if self.server.subprotocols.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.subprotocols",
                reason: "must name at least one subprotocol".into(),
            });
        }
        if self.limits.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.handshake_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
