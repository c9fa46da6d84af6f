//! Backing store contract and implementations.
//!
//! Every component talks to the shared key-value store through [`KvStore`].
//! Multi-key state transitions are expressed as a `Vec<StoreOp>` and handed
//! to [`KvStore::exec`], which applies all of them or none of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors raised by a backing store. All of them mean the store could not
/// complete the request; none are retried here.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unsupported storage type: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One step of an atomic batch.
///
/// List values and set members are message/timeout ids, so they are plain
/// strings. Hash and string values are opaque blobs.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// SET
    Set { key: String, value: Vec<u8> },
    /// SET with expiry; the key vanishes once `ttl` elapses.
    SetWithTtl {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    /// DEL
    Delete { keys: Vec<String> },
    /// HSETNX: write only if the field is absent.
    HashSetIfAbsent {
        key: String,
        field: String,
        value: Vec<u8>,
    },
    /// HDEL
    HashDelete { key: String, field: String },
    /// LPUSH
    ListPushHead { key: String, value: String },
    /// RPUSH
    ListPushTail { key: String, value: String },
    /// LREM. `count` follows Redis: positive scans from the head, negative
    /// from the tail, zero removes every occurrence.
    ListRemove {
        key: String,
        count: i64,
        value: String,
    },
    /// SADD
    SetAdd { key: String, member: String },
    /// SREM
    SetRemove { key: String, member: String },
    /// ZADD
    SortedSetAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// ZREM
    SortedSetRemove { key: String, member: String },
}

/// Shared key-value store with Redis semantics.
///
/// Implementations:
/// - `RedisStore`: Redis via MULTI/EXEC pipelines
/// - `InMemoryStore`: in-process store for tests and embedding
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Apply every op atomically: all take effect or none do.
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Increment an integer value, creating it at zero first.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hash_values(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    async fn hash_len(&self, key: &str) -> Result<usize>;

    /// Whole list, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Pop from the tail of `source` and push onto the head of
    /// `destination` as one step, waiting up to `timeout` for `source` to
    /// become non-empty. Returns `None` when the wait elapses.
    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Union of several sets, each member reported once.
    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Members scored within `[min, max]`, lowest score first.
    async fn sorted_range_by_score(&self, key: &str, min: i64, max: i64)
        -> Result<Vec<(String, i64)>>;

    /// Keys matching a Redis `MATCH` glob (`*`, `?`, `[...]`, `\` escapes).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Set `key` to `token` with expiry if it does not exist.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it still holds `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}

/// Initialize the backing store based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: in-memory");
            Ok(Arc::new(InMemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StorageType::Redis => {
            info!("Storage: redis at {}", config.redis.url);
            let store = RedisStore::new(&config.redis.url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StorageType::Redis => {
            tracing::error!("Redis storage requested but 'redis' feature is not enabled");
            Err(StorageError::Unsupported("redis".to_string()))
        }
    }
}

/// Compile a Redis `MATCH` pattern.
///
/// Redis negates a class with `[^...]` and escapes with `\`; `glob` uses
/// `[!...]` and bracketed literals. Runs of `*` collapse to one, as they
/// match the same keys.
pub(crate) fn key_pattern(pattern: &str) -> Result<glob::Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_class => match chars.next() {
                Some(special @ ('*' | '?' | '[' | ']')) => {
                    translated.push('[');
                    translated.push(special);
                    translated.push(']');
                }
                Some(other) => translated.push(other),
                None => translated.push('\\'),
            },
            '[' if !in_class => {
                in_class = true;
                translated.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    translated.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                translated.push(']');
            }
            '*' if !in_class && translated.ends_with('*') => {}
            _ => translated.push(c),
        }
    }

    glob::Pattern::new(&translated).map_err(|e| StorageError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}
