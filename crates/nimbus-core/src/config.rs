//! Configuration for the sharing engine.
//!
//! TOML with sensible defaults; a partial file only overrides the keys it
//! names. Loaded from:
//! - macOS: ~/Library/Application Support/nimbus/config.toml
//! - Linux: ~/.config/nimbus/config.toml
//! - Windows: %APPDATA%/nimbus/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Named lock settings
    pub lock: LockConfig,
    /// Replicator settings
    pub replicator: ReplicatorConfig,
    /// File upload settings
    pub uploads: UploadsConfig,
    /// Worker concurrency settings
    pub concurrency: ConcurrencyConfig,
    /// Outbound HTTP settings
    pub http: HttpConfig,
}

/// Named lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Distributed lock backend URL (None = in-process locks)
    pub url: Option<String>,
    /// Maximum time to wait for a lock (seconds)
    pub wait_timeout_secs: u64,
    /// TTL of a distributed lock hold (seconds)
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            url: None,
            wait_timeout_secs: 30,
            ttl_secs: 20,
        }
    }
}

/// Replicator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Changes-feed entries processed per invocation
    pub batch_size: usize,
    /// Retry attempts before a batch is abandoned
    pub retries: u32,
    /// Base delay of the exponential backoff (milliseconds)
    pub backoff_base_ms: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            retries: 8,
            backoff_base_ms: 250,
        }
    }
}

/// File upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    /// Lifetime of an upload key (seconds)
    pub key_ttl_seconds: u64,
    /// Maximum accepted file size in bytes
    pub max_file_size_bytes: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            key_ttl_seconds: 300,
            max_file_size_bytes: 5 * 1024 * 1024 * 1024, // 5GB
        }
    }
}

/// Worker concurrency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent workers per (sharing, direction)
    pub max_per_sharing: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_per_sharing: 1 }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "nimbus", "nimbus")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Lock wait budget as a duration
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.wait_timeout_secs)
    }

    /// Upload key lifetime as a duration
    pub fn upload_key_ttl(&self) -> Duration {
        Duration::from_secs(self.uploads.key_ttl_seconds)
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
