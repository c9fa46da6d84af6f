//! Application configuration.
//!
//! Aggregates configuration from all components into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod queue;
mod storage;

pub use queue::{AdminConfig, QueueConfig, DEFAULT_RECEIVE_TIMEOUT_SECS};
pub use storage::{RedisConfig, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "redbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "REDBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "REDBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "REDBUS_LOG";

use serde::Deserialize;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Reliable queue configuration.
    pub queue: QueueConfig,
    /// Timeout store configuration.
    pub timeouts: TimeoutsConfig,
    /// Queue admin configuration.
    pub admin: AdminConfig,
}

/// Timeout store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Endpoint whose timeouts the store tracks. Part of every timeout key.
    pub endpoint_name: String,
    /// Offset from now suggested as the next due-timeout poll.
    pub next_poll_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            endpoint_name: String::new(),
            next_poll_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `redbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory storage, no background sweep.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                ..Default::default()
            },
            queue: QueueConfig {
                schedule_lease_sweep: false,
                ..Default::default()
            },
            timeouts: TimeoutsConfig {
                endpoint_name: "test".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
