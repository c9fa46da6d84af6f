//! Key naming scheme.
//!
//! Every component derives its storage key names from a logical identity
//! here. Nothing in this module touches the store.
//!
//! | Purpose | Pattern |
//! |---|---|
//! | ready list | `<prefix>:<queue>:ids` |
//! | claimed list | `<prefix>:<queue>:claimed` |
//! | message hash | `<prefix>:<queue>:messages` |
//! | claim timeout | `<prefix>:<queue>:timeout:<message_id>` |
//! | counter | `<prefix>:<queue>:counter` |
//! | saga record | `<prefix>:saga:<type>:<id>` |
//! | saga unique index | `<prefix>:saga:property:<type>:<property>:<value_hash>` |
//! | timeouts | `<prefix>:timeouts:<endpoint>:{data,times,ids,sagaidmap}` |
//! | subscription set | `<prefix>:subs:<message_type>:<version>` |

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::address::Address;

/// Default prefix for every key written by this crate.
pub const DEFAULT_KEY_PREFIX: &str = "redbus";

/// Maps a queue address to the key names that make up the queue.
///
/// Implementations must be pure: the same address always yields the same
/// names, and `queue_address_from_key` inverts `message_id_queue_name`.
pub trait KeyNameProvider: Send + Sync {
    /// Prefix shared by all queue keys.
    fn key_prefix(&self) -> &str;

    /// When true the machine part of an address is not part of the name,
    /// so every machine hosting the endpoint shares one queue.
    fn use_shared_queues(&self) -> bool;

    fn base_queue_name(&self, address: &Address) -> String {
        if self.use_shared_queues() {
            format!("{}:{}", self.key_prefix(), address.queue())
        } else {
            format!("{}:{}", self.key_prefix(), address)
        }
    }

    /// Ready list: ids awaiting delivery.
    fn message_id_queue_name(&self, address: &Address) -> String {
        format!("{}:ids", self.base_queue_name(address))
    }

    /// Claimed list: ids leased to a consumer.
    fn claimed_message_id_list_name(&self, address: &Address) -> String {
        format!("{}:claimed", self.base_queue_name(address))
    }

    /// Hash of message id to serialized envelope.
    fn message_hash_name(&self, address: &Address) -> String {
        format!("{}:messages", self.base_queue_name(address))
    }

    fn counter_name(&self, address: &Address) -> String {
        format!("{}:counter", self.base_queue_name(address))
    }

    /// TTL-bearing lease marker for a claimed message.
    fn message_claim_timeout_key(&self, address: &Address, message_id: &str) -> String {
        format!("{}:timeout:{}", self.base_queue_name(address), message_id)
    }

    /// Recover the address from a ready-list key.
    ///
    /// Lease keys for a message whose id is `ids` share the ready-list
    /// suffix and are rejected.
    fn queue_address_from_key(&self, key: &str) -> Option<Address> {
        let rest = key
            .strip_prefix(self.key_prefix())?
            .strip_prefix(':')?
            .strip_suffix(":ids")?;
        if rest.ends_with(":timeout") || rest.contains(":timeout:") {
            return None;
        }
        Address::parse(rest).ok()
    }

    /// Glob pattern matching every ready-list key.
    fn key_search_pattern(&self) -> String {
        format!("{}:*:ids", self.key_prefix())
    }
}

/// Default [`KeyNameProvider`].
#[derive(Debug, Clone)]
pub struct QueueKeyNameProvider {
    key_prefix: String,
    shared_queues: bool,
}

impl QueueKeyNameProvider {
    /// Queue keys live under `<prefix>:queue`.
    pub fn new(prefix: &str, shared_queues: bool) -> Self {
        Self {
            key_prefix: format!("{}:queue", prefix),
            shared_queues,
        }
    }
}

impl Default for QueueKeyNameProvider {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX, false)
    }
}

impl KeyNameProvider for QueueKeyNameProvider {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn use_shared_queues(&self) -> bool {
        self.shared_queues
    }
}

/// Distributed lock guarding bulk admin moves on a queue.
pub fn queue_lock_key(prefix: &str, address: &Address) -> String {
    format!("{}:lock:{}", prefix, address)
}

/// Primary key of a saga record.
pub fn saga_key(prefix: &str, saga_type: &str, id: Uuid) -> String {
    format!("{}:saga:{}:{}", prefix, saga_type, id.simple())
}

/// Monotonic version counter of a saga record.
pub fn saga_version_key(prefix: &str, saga_type: &str, id: Uuid) -> String {
    format!("{}:version", saga_key(prefix, saga_type, id))
}

/// Set of unique-property index keys owned by a saga record.
pub fn saga_property_map_key(prefix: &str, saga_type: &str, id: Uuid) -> String {
    format!("{}:map", saga_key(prefix, saga_type, id))
}

/// Unique-property index entry. The value is hashed so arbitrary text
/// cannot break the key layout.
pub fn saga_property_key(prefix: &str, saga_type: &str, property: &str, value: &str) -> String {
    format!(
        "{}:saga:property:{}:{}:{}",
        prefix,
        saga_type,
        property,
        value_hash(value)
    )
}

/// First 16 bytes of SHA-256, hex encoded.
pub fn value_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..16])
}

/// Key names used by one endpoint's timeout store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutKeys {
    /// Hash: timeout id to serialized record.
    pub data: String,
    /// Sorted set: timeout id scored by due time.
    pub times: String,
    /// List of timeout ids.
    pub ids: String,
    /// Hash: correlation id to timeout id.
    pub correlation: String,
}

impl TimeoutKeys {
    pub fn new(prefix: &str, endpoint: &str) -> Self {
        let base = format!("{}:timeouts:{}", prefix, endpoint);
        Self {
            data: format!("{}:data", base),
            times: format!("{}:times", base),
            ids: format!("{}:ids", base),
            correlation: format!("{}:sagaidmap", base),
        }
    }
}

/// Subscriber set for one message type version.
pub fn subscription_set_key(prefix: &str, type_name: &str, version: &str) -> String {
    format!("{}:subs:{}:{}", prefix, type_name, version)
}
