//! Reliable queue.
//!
//! A queue is three keys: a ready list of message ids, a claimed list of ids
//! leased to consumers, and a hash of id to serialized envelope. Every state
//! transition between them is a single atomic batch.
//!
//! ```text
//!   send ──LPUSH──▶ ready ──BRPOPLPUSH──▶ claimed ──commit──▶ (gone)
//!                    ▲                       │
//!                    └──── rollback/expiry ──┘
//! ```
//!
//! Transactional receives set a lease key with a TTL straight after the
//! claim. The lease sweep moves claimed ids whose lease key has expired back
//! to the head of the ready list, so a crashed consumer's work is
//! redelivered. The claim and the lease write are two round trips, so a
//! sweep only requeues an id it found lease-less on its previous pass too;
//! a claim younger than one sweep interval is never taken back.
//! Requeued ids go to the head, ahead of messages already waiting: ordering
//! is approximately FIFO, never guaranteed.

mod envelope;
pub mod manager;
mod sweeper;

pub use envelope::{headers, Envelope, MessageIntent};
pub use manager::QueueManager;
pub use sweeper::{spawn_lease_sweeper, SweeperHandle};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::codec::{Codec, JsonCodec};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::keys::KeyNameProvider;
use crate::storage::{KvStore, StoreOp};
use crate::transaction::{ActionParticipant, Enlist};

/// Ops that acknowledge a claimed message.
pub(crate) fn commit_receive_ops(
    keys: &dyn KeyNameProvider,
    address: &Address,
    message_id: &str,
) -> Vec<StoreOp> {
    vec![
        StoreOp::ListRemove {
            key: keys.claimed_message_id_list_name(address),
            count: -1,
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

/// Ops that hand a claimed message back to the head of the ready list.
pub(crate) fn rollback_receive_ops(
    keys: &dyn KeyNameProvider,
    address: &Address,
    message_id: &str,
) -> Vec<StoreOp> {
    vec![
        StoreOp::ListRemove {
            key: keys.claimed_message_id_list_name(address),
            count: -1,
            value: message_id.to_string(),
        },
        StoreOp::ListPushHead {
            key: keys.message_id_queue_name(address),
            value: message_id.to_string(),
        },
        StoreOp::Delete {
            keys: vec![keys.message_claim_timeout_key(address, message_id)],
        },
    ]
}

/// Ops that store a serialized envelope and make it ready.
pub(crate) fn send_ops(
    keys: &dyn KeyNameProvider,
    destination: &Address,
    message_id: &str,
    payload: Vec<u8>,
) -> Vec<StoreOp> {
    vec![
        StoreOp::HashSetIfAbsent {
            key: keys.message_hash_name(destination),
            field: message_id.to_string(),
            value: payload,
        },
        StoreOp::ListPushHead {
            key: keys.message_id_queue_name(destination),
            value: message_id.to_string(),
        },
    ]
}

/// Claimed ids each queue's last sweep found without a lease.
#[derive(Debug, Default)]
pub(crate) struct LeaseSuspects {
    by_queue: Mutex<HashMap<Address, HashSet<String>>>,
}

/// Requeue claimed ids on `address` found without a lease key by this
/// sweep and the one before it.
pub(crate) async fn expire_claimed(
    store: &dyn KvStore,
    keys: &dyn KeyNameProvider,
    suspects: &LeaseSuspects,
    address: &Address,
) -> Result<usize> {
    let claimed = store
        .list_range(&keys.claimed_message_id_list_name(address))
        .await?;
    let previous = suspects
        .by_queue
        .lock()
        .await
        .remove(address)
        .unwrap_or_default();

    let mut unleased = HashSet::new();
    let mut requeued = 0;
    for message_id in claimed {
        if store
            .exists(&keys.message_claim_timeout_key(address, &message_id))
            .await?
        {
            continue;
        }
        if !previous.contains(&message_id) {
            unleased.insert(message_id);
            continue;
        }

        store
            .exec(rollback_receive_ops(keys, address, &message_id))
            .await?;
        requeued += 1;
        warn!(
            queue = %address,
            message_id = %message_id,
            "Claim lease expired, message requeued"
        );
    }

    if !unleased.is_empty() {
        suspects
            .by_queue
            .lock()
            .await
            .insert(address.clone(), unleased);
    }
    Ok(requeued)
}

#[derive(Debug, Clone)]
struct Receiver {
    address: Address,
    transactional: bool,
}

/// Reliable point-to-point queue.
pub struct ReliableQueue<C: Codec = JsonCodec> {
    store: Arc<dyn KvStore>,
    keys: Arc<dyn KeyNameProvider>,
    codec: C,
    config: QueueConfig,
    receiver: RwLock<Option<Receiver>>,
    sweeper: Mutex<Option<SweeperHandle>>,
    suspects: Arc<LeaseSuspects>,
}

impl<C: Codec> ReliableQueue<C> {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Arc<dyn KeyNameProvider>,
        codec: C,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            keys,
            codec,
            config,
            receiver: RwLock::new(None),
            sweeper: Mutex::new(None),
            suspects: Arc::new(LeaseSuspects::default()),
        }
    }

    /// Bind the queue to the address it receives from.
    ///
    /// Starts a lease sweeper for that address when the configuration asks
    /// for one. Calling `init` again rebinds and restarts the sweeper.
    pub async fn init(&self, address: Address, transactional: bool) {
        info!(queue = %address, transactional, "Queue receiver initialized");

        let mut sweeper = self.sweeper.lock().await;
        if let Some(previous) = sweeper.take() {
            previous.stop();
        }
        if self.config.schedule_lease_sweep {
            let store = self.store.clone();
            let keys = self.keys.clone();
            let suspects = self.suspects.clone();
            let target = address.clone();
            *sweeper = Some(spawn_lease_sweeper(
                address.clone(),
                self.config.sweep_interval(),
                move || {
                    let store = store.clone();
                    let keys = keys.clone();
                    let suspects = suspects.clone();
                    let target = target.clone();
                    async move {
                        expire_claimed(store.as_ref(), keys.as_ref(), &suspects, &target).await
                    }
                },
            ));
        }

        *self.receiver.write().await = Some(Receiver {
            address,
            transactional,
        });
    }

    /// Stop the lease sweeper started by `init`, if any.
    pub async fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.shutdown().await;
        }
    }

    /// Address this queue receives from, once initialized.
    pub async fn address(&self) -> Option<Address> {
        self.receiver.read().await.as_ref().map(|r| r.address.clone())
    }

    /// Receive is a blocking wait, so callers should always try it.
    pub fn has_message(&self) -> bool {
        true
    }

    /// Send `envelope` to `destination`, assigning an id if it has none.
    ///
    /// Resending an id already stored does not overwrite the stored
    /// envelope, but does push the id onto the ready list again. With a
    /// transaction the write happens when the transaction commits.
    pub async fn send(
        &self,
        mut envelope: Envelope,
        destination: &Address,
        tx: Option<&dyn Enlist>,
    ) -> Result<String> {
        let message_id = envelope.ensure_id().to_string();
        let payload = self.codec.encode(&envelope)?;
        let ops = send_ops(self.keys.as_ref(), destination, &message_id, payload);

        match tx {
            Some(tx) => {
                debug!(queue = %destination, message_id = %message_id, "Send deferred to transaction");
                tx.enlist(Box::new(ActionParticipant::batches(
                    format!("send {message_id}"),
                    self.store.clone(),
                    ops,
                    Vec::new(),
                )))
                .await;
            }
            None => {
                self.store.exec(ops).await?;
                debug!(queue = %destination, message_id = %message_id, "Message sent");
            }
        }

        Ok(message_id)
    }

    /// Claim the next message, waiting up to the configured receive timeout.
    ///
    /// Without a transaction, or when the queue was initialized as
    /// non-transactional, the claim is acknowledged at once. Otherwise a
    /// lease key is set and the acknowledgment is enlisted: commit deletes
    /// the message, rollback or in-doubt puts it back at the head of the
    /// ready list.
    pub async fn receive(&self, tx: Option<&dyn Enlist>) -> Result<Option<Envelope>> {
        let receiver = self
            .receiver
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)?;
        let address = &receiver.address;
        let keys = self.keys.as_ref();

        let claimed = self
            .store
            .blocking_move(
                &keys.message_id_queue_name(address),
                &keys.claimed_message_id_list_name(address),
                self.config.receive_timeout(),
            )
            .await?;
        let Some(message_id) = claimed else {
            return Ok(None);
        };

        let leased = tx.filter(|_| receiver.transactional);
        if leased.is_some() {
            self.store
                .exec(vec![StoreOp::SetWithTtl {
                    key: keys.message_claim_timeout_key(address, &message_id),
                    value: Utc::now().to_rfc3339().into_bytes(),
                    ttl: self.config.lease_timeout(),
                }])
                .await?;
        }

        let Some(payload) = self
            .store
            .hash_get(&keys.message_hash_name(address), &message_id)
            .await?
        else {
            // Already acknowledged through a duplicate ready entry
            warn!(queue = %address, message_id = %message_id, "Claimed id has no stored message, dropping");
            self.store
                .exec(vec![
                    StoreOp::ListRemove {
                        key: keys.claimed_message_id_list_name(address),
                        count: -1,
                        value: message_id.clone(),
                    },
                    StoreOp::Delete {
                        keys: vec![keys.message_claim_timeout_key(address, &message_id)],
                    },
                ])
                .await?;
            return Ok(None);
        };

        // Undecodable messages stay claimed until the sweep requeues them
        let envelope: Envelope = self.codec.decode(&payload)?;

        match leased {
            Some(tx) => {
                tx.enlist(Box::new(ActionParticipant::batches(
                    format!("receive {message_id}"),
                    self.store.clone(),
                    commit_receive_ops(keys, address, &message_id),
                    rollback_receive_ops(keys, address, &message_id),
                )))
                .await;
                debug!(queue = %address, message_id = %message_id, "Message claimed under lease");
            }
            None => {
                self.commit_receive(address, &message_id).await?;
                debug!(queue = %address, message_id = %message_id, "Message received");
            }
        }

        Ok(Some(envelope))
    }

    /// Acknowledge a claimed message: it is gone for good.
    pub async fn commit_receive(&self, address: &Address, message_id: &str) -> Result<()> {
        self.store
            .exec(commit_receive_ops(self.keys.as_ref(), address, message_id))
            .await?;
        Ok(())
    }

    /// Give a claimed message back: it is immediately receivable again.
    pub async fn rollback_receive(&self, address: &Address, message_id: &str) -> Result<()> {
        self.store
            .exec(rollback_receive_ops(self.keys.as_ref(), address, message_id))
            .await?;
        Ok(())
    }

    /// Requeue claimed messages on the receive address whose lease expired.
    ///
    /// An id is requeued on the second consecutive call that finds it
    /// without a lease.
    pub async fn expire_claimed_messages(&self) -> Result<usize> {
        let address = self.address().await.ok_or(Error::NotInitialized)?;
        expire_claimed(
            self.store.as_ref(),
            self.keys.as_ref(),
            &self.suspects,
            &address,
        )
        .await
    }

    /// Next value of the queue's counter.
    pub async fn increment_id(&self, address: &Address) -> Result<i64> {
        Ok(self
            .store
            .incr(&self.keys.counter_name(address), 1)
            .await?)
    }
}
