//! Queue administration.
//!
//! Works over any queue on the store, not just the one a [`ReliableQueue`]
//! receives from. Used by tooling to inspect queues and to push failed
//! messages back to where they came from.
//!
//! [`ReliableQueue`]: super::ReliableQueue

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::codec::{Codec, JsonCodec};
use crate::config::AdminConfig;
use crate::error::{Error, Result};
use crate::keys::{queue_lock_key, KeyNameProvider};
use crate::storage::{KvStore, StoreOp};

use super::envelope::{headers, Envelope};
use super::{expire_claimed, send_ops, LeaseSuspects};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Admin operations over queues stored with a given key scheme.
pub struct QueueManager<C: Codec = JsonCodec> {
    store: Arc<dyn KvStore>,
    keys: Arc<dyn KeyNameProvider>,
    codec: C,
    config: AdminConfig,
    suspects: LeaseSuspects,
}

impl<C: Codec> QueueManager<C> {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Arc<dyn KeyNameProvider>,
        codec: C,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            keys,
            codec,
            config,
            suspects: LeaseSuspects::default(),
        }
    }

    /// Every queue that currently has a ready list.
    pub async fn get_all_queues(&self) -> Result<Vec<Address>> {
        let found = self.store.scan_keys(&self.keys.key_search_pattern()).await?;
        Ok(found
            .iter()
            .filter_map(|key| self.keys.queue_address_from_key(key))
            .collect())
    }

    /// Remove a queue and every message in it.
    pub async fn delete_queue(&self, address: &Address) -> Result<()> {
        let keys = self.keys.as_ref();
        let mut doomed = vec![
            keys.message_id_queue_name(address),
            keys.claimed_message_id_list_name(address),
            keys.message_hash_name(address),
            keys.counter_name(address),
        ];
        doomed.extend(
            self.store
                .scan_keys(&keys.message_claim_timeout_key(address, "*"))
                .await?,
        );

        self.store.exec(vec![StoreOp::Delete { keys: doomed }]).await?;
        info!(queue = %address, "Queue deleted");
        Ok(())
    }

    /// Store an envelope as-is on `address`. An existing id is kept.
    pub async fn send_message_to_queue(
        &self,
        mut envelope: Envelope,
        address: &Address,
    ) -> Result<String> {
        let message_id = envelope.ensure_id().to_string();
        let payload = self.codec.encode(&envelope)?;
        self.store
            .exec(send_ops(self.keys.as_ref(), address, &message_id, payload))
            .await?;
        Ok(message_id)
    }

    /// Remove a message wherever it sits in the queue.
    pub async fn delete_message(&self, address: &Address, message_id: &str) -> Result<()> {
        self.store
            .exec(self.removal_ops(address, message_id))
            .await?;
        debug!(queue = %address, message_id = %message_id, "Message deleted");
        Ok(())
    }

    /// Messages waiting in the ready list.
    pub async fn get_message_count(&self, address: &Address) -> Result<usize> {
        Ok(self
            .store
            .list_len(&self.keys.message_id_queue_name(address))
            .await?)
    }

    /// Every stored message, claimed or not, in no particular order.
    pub async fn get_all_messages(&self, address: &Address) -> Result<Vec<Envelope>> {
        let payloads = self
            .store
            .hash_values(&self.keys.message_hash_name(address))
            .await?;
        payloads
            .iter()
            .map(|payload| self.codec.decode(payload).map_err(Error::from))
            .collect()
    }

    pub async fn get_message_by_id(
        &self,
        address: &Address,
        message_id: &str,
    ) -> Result<Option<Envelope>> {
        let payload = self
            .store
            .hash_get(&self.keys.message_hash_name(address), message_id)
            .await?;
        match payload {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Move one message from `source` to the head of `target`'s ready list.
    /// Returns false when `source` has no such message.
    pub async fn move_message(
        &self,
        source: &Address,
        target: &Address,
        message_id: &str,
    ) -> Result<bool> {
        let payload = self
            .store
            .hash_get(&self.keys.message_hash_name(source), message_id)
            .await?;
        let Some(payload) = payload else {
            return Ok(false);
        };

        let mut ops = self.removal_ops(source, message_id);
        ops.extend(send_ops(self.keys.as_ref(), target, message_id, payload));
        self.store.exec(ops).await?;

        debug!(
            source = %source,
            target = %target,
            message_id = %message_id,
            "Message moved"
        );
        Ok(true)
    }

    /// Move a failed message back to the queue named by its
    /// [`headers::FAILED_QUEUE`] header.
    pub async fn return_message_to_source(
        &self,
        address: &Address,
        message_id: &str,
    ) -> Result<bool> {
        let Some(envelope) = self.get_message_by_id(address, message_id).await? else {
            return Ok(false);
        };
        let source = failed_queue(&envelope)?;
        self.move_message(address, &source, message_id).await
    }

    /// Return every message on `address` to its source queue.
    ///
    /// Holds the queue's admin lock while moving. Nothing is moved if any
    /// message lacks its source header.
    pub async fn return_all_messages_to_source(&self, address: &Address) -> Result<usize> {
        let lock = queue_lock_key(self.keys.key_prefix(), address);
        let token = self.acquire_lock(&lock).await?;

        let result = self.return_all_locked(address).await;

        match self.store.unlock(&lock, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %lock, "Admin lock expired before release"),
            Err(e) => error!(lock = %lock, error = %e, "Failed to release admin lock"),
        }
        result
    }

    async fn return_all_locked(&self, address: &Address) -> Result<usize> {
        let mut moves = Vec::new();
        for envelope in self.get_all_messages(address).await? {
            let source = failed_queue(&envelope)?;
            moves.push((envelope.id, source));
        }

        let mut moved = 0;
        for (message_id, source) in moves {
            if self.move_message(address, &source, &message_id).await? {
                moved += 1;
            }
        }

        info!(queue = %address, moved, "Returned messages to source queues");
        Ok(moved)
    }

    /// Requeue claimed messages on `address` whose lease expired, once two
    /// consecutive calls have found them without a lease.
    pub async fn expire_claimed_messages(&self, address: &Address) -> Result<usize> {
        expire_claimed(
            self.store.as_ref(),
            self.keys.as_ref(),
            &self.suspects,
            address,
        )
        .await
    }

    fn removal_ops(&self, address: &Address, message_id: &str) -> Vec<StoreOp> {
        let keys = self.keys.as_ref();
        vec![
            StoreOp::ListRemove {
                key: keys.message_id_queue_name(address),
                count: 0,
                value: message_id.to_string(),
            },
            StoreOp::ListRemove {
                key: keys.claimed_message_id_list_name(address),
                count: 0,
                value: message_id.to_string(),
            },
            StoreOp::HashDelete {
                key: keys.message_hash_name(address),
                field: message_id.to_string(),
            },
            StoreOp::Delete {
                keys: vec![keys.message_claim_timeout_key(address, message_id)],
            },
        ]
    }

    async fn acquire_lock(&self, lock: &str) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.lock_wait();

        loop {
            if self
                .store
                .try_lock(lock, &token, self.config.lock_ttl())
                .await?
            {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    lock: lock.to_string(),
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

fn failed_queue(envelope: &Envelope) -> Result<Address> {
    let header = envelope
        .header(headers::FAILED_QUEUE)
        .ok_or_else(|| Error::MissingRequiredHeader {
            message_id: envelope.id.clone(),
            header: headers::FAILED_QUEUE.to_string(),
        })?;
    Address::parse(header)
}
