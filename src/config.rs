//! WolfClone Configuration
//!
//! This module provides configuration structures for the WolfClone
//! tablet replica clone engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfClone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCloneConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Clone engine tuning
    #[serde(default)]
    pub clone: CloneConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data root holding tablet data, metadata, staging and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Clone engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Attempts per source replica before declaring it unreachable
    #[serde(default = "default_download_max_attempts")]
    pub download_max_attempts: u32,

    /// Initial retry backoff in milliseconds (doubled per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Connect timeout for source replicas in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single source request or file download in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Missing version count above which a full clone is preferred
    #[serde(default = "default_max_incremental_versions")]
    pub max_incremental_versions: u64,

    /// Missing rowset count above which a full clone is preferred
    #[serde(default = "default_max_incremental_rowsets")]
    pub max_incremental_rowsets: usize,

    /// Age after which abandoned staging directories are swept
    #[serde(default = "default_ttl_secs")]
    pub staging_ttl_secs: u64,

    /// Age after which unreleased source snapshots are swept
    #[serde(default = "default_ttl_secs")]
    pub snapshot_ttl_secs: u64,

    /// Free space kept in reserve on the staging disk, in megabytes
    #[serde(default = "default_disk_reserve_mb")]
    pub disk_reserve_mb: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,

    /// Shared token required by download and snapshot requests
    #[serde(default)]
    pub token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_download_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_retry_backoff_max_ms() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    3600
}

fn default_max_incremental_versions() -> u64 {
    1000
}

fn default_max_incremental_rowsets() -> usize {
    200
}

fn default_ttl_secs() -> u64 {
    86400
}

fn default_disk_reserve_mb() -> u64 {
    64
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8040".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfclone")
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            download_max_attempts: default_download_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            connect_timeout_secs: default_connect_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_incremental_versions: default_max_incremental_versions(),
            max_incremental_rowsets: default_max_incremental_rowsets(),
            staging_ttl_secs: default_ttl_secs(),
            snapshot_ttl_secs: default_ttl_secs(),
            disk_reserve_mb: default_disk_reserve_mb(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
            token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl CloneConfig {
    /// Initial retry backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Maximum retry backoff as Duration
    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    /// Connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request/download timeout as Duration
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Staging TTL as Duration
    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_secs)
    }

    /// Snapshot TTL as Duration
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }
}

impl WolfCloneConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCloneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.clone.download_max_attempts == 0 {
            return Err(crate::Error::Config(
                "clone.download_max_attempts must be at least 1".into(),
            ));
        }

        if self.clone.retry_backoff_ms > self.clone.retry_backoff_max_ms {
            return Err(crate::Error::Config(
                "clone.retry_backoff_ms cannot exceed clone.retry_backoff_max_ms".into(),
            ));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }
}
