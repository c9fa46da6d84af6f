//! Storage configuration types.

use serde::Deserialize;

use crate::keys::DEFAULT_KEY_PREFIX;

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-process store. Nothing survives a restart.
    Memory,
    #[default]
    Redis,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for every key written by this crate.
    pub key_prefix: String,
    /// Drop the machine part of addresses from queue key names, so every
    /// machine hosting an endpoint consumes the same queue.
    pub shared_queues: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            shared_queues: false,
        }
    }
}
