//! Configuration loading for convsync-server.
//!
//! Configuration is loaded from a TOML file (default: `convsync.toml`).

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for convsync-server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Sync behaviour.
    pub sync: SyncConfig,
    /// IM engine collaborator.
    pub engine: EngineConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (default: 0.0.0.0:8090).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Bind address for the IM engine's hooks (default: 127.0.0.1:8091).
    ///
    /// The hooks carry no login uid; keep this off public interfaces.
    #[serde(default = "default_internal_bind_address")]
    pub internal_bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Number of hash partitions for uid-sharded tables (default: 5).
    ///
    /// Changing this on an existing database moves rows to different
    /// partitions; treat it as fixed after the first start.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Maximum pooled connections (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Sync behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// When true, every device sees the same history and device offsets are
    /// not consulted. When false (default), per-device offsets and version
    /// watermarks are active.
    #[serde(default)]
    pub save_across_device: bool,
    /// Recent messages per conversation when the client sends 0 (default: 20).
    #[serde(default = "default_msg_count")]
    pub default_msg_count: u32,
    /// Seconds a staged batch waits for its ack before going stale (default: 300).
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Default page size of message-extra sync (default: 100).
    #[serde(default = "default_page_limit")]
    pub extra_default_limit: u32,
    /// Maximum page size of message-extra sync (default: 10000).
    #[serde(default = "default_extra_max_limit")]
    pub extra_max_limit: u32,
    /// Default page size of reaction sync (default: 100).
    #[serde(default = "default_page_limit")]
    pub reaction_default_limit: u32,
    /// Maximum page size of reaction sync (default: 1000).
    #[serde(default = "default_max_limit")]
    pub reaction_max_limit: u32,
    /// Default page size of reminder sync (default: 100).
    #[serde(default = "default_page_limit")]
    pub reminder_default_limit: u32,
    /// Maximum page size of reminder sync (default: 1000).
    #[serde(default = "default_max_limit")]
    pub reminder_max_limit: u32,
}

impl SyncConfig {
    /// Clamp a requested page size: 0 means default, anything above max is max.
    pub fn clamp_limit(requested: u32, default: u32, max: u32) -> u32 {
        if requested == 0 {
            default.min(max)
        } else {
            requested.min(max)
        }
    }
}

/// IM engine collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the engine's HTTP API.
    #[serde(default = "default_engine_url")]
    pub api_url: String,
    /// Per-request timeout in seconds (default: 10).
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum requests per uid per minute (default: 600).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Maximum requests per second across all users (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_internal_bind_address() -> String {
    "127.0.0.1:8091".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("convsync.db")
}

fn default_shard_count() -> u32 {
    5
}

fn default_max_connections() -> u32 {
    10
}

fn default_msg_count() -> u32 {
    20
}

fn default_ack_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_page_limit() -> u32 {
    100
}

fn default_extra_max_limit() -> u32 {
    10_000
}

fn default_max_limit() -> u32 {
    1000
}

fn default_engine_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_engine_timeout_secs() -> u64 {
    10
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_across_device: false,
            default_msg_count: default_msg_count(),
            ack_timeout_secs: default_ack_timeout_secs(),
            extra_default_limit: default_page_limit(),
            extra_max_limit: default_extra_max_limit(),
            reaction_default_limit: default_page_limit(),
            reaction_max_limit: default_max_limit(),
            reminder_default_limit: default_page_limit(),
            reminder_max_limit: default_max_limit(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: default_bind_address(),
                internal_bind_address: default_internal_bind_address(),
            },
            storage: StorageConfig {
                database: default_database_path(),
                shard_count: default_shard_count(),
                max_connections: default_max_connections(),
            },
            sync: SyncConfig::default(),
            engine: EngineConfig {
                api_url: default_engine_url(),
                timeout_secs: default_engine_timeout_secs(),
            },
            limits: LimitsConfig {
                requests_per_minute: default_requests_per_minute(),
                global_requests_per_second: default_global_requests_per_second(),
            },
            http: HttpConfig {
                metrics_enabled: default_metrics_enabled(),
            },
            cleanup: CleanupConfig {
                interval_secs: default_cleanup_interval(),
                enabled: default_cleanup_enabled(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds
    /// values the server cannot run with.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make limiters or sharding unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("storage.shard_count", self.storage.shard_count),
            ("storage.max_connections", self.storage.max_connections),
            ("limits.requests_per_minute", self.limits.requests_per_minute),
            (
                "limits.global_requests_per_second",
                self.limits.global_requests_per_second,
            ),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
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
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
