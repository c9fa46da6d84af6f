//! Subscription store: one set of subscriber addresses per message type.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::Result;
use crate::keys::subscription_set_key;
use crate::storage::{KvStore, StoreOp};
use crate::transaction::{ActionParticipant, Enlist};

/// A versioned message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageType {
    pub type_name: String,
    pub version: String,
}

impl MessageType {
    pub fn new(type_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Version={}", self.type_name, self.version)
    }
}

pub struct SubscriptionStore {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Nothing to prepare; sets are created on first subscribe.
    pub fn init(&self) {}

    pub async fn subscribe(
        &self,
        subscriber: &Address,
        message_types: &[MessageType],
        tx: Option<&dyn Enlist>,
    ) -> Result<()> {
        let ops = message_types
            .iter()
            .map(|message_type| StoreOp::SetAdd {
                key: self.set_key(message_type),
                member: subscriber.to_string(),
            })
            .collect();
        self.apply(format!("subscribe {subscriber}"), ops, tx).await
    }

    pub async fn unsubscribe(
        &self,
        subscriber: &Address,
        message_types: &[MessageType],
        tx: Option<&dyn Enlist>,
    ) -> Result<()> {
        let ops = message_types
            .iter()
            .map(|message_type| StoreOp::SetRemove {
                key: self.set_key(message_type),
                member: subscriber.to_string(),
            })
            .collect();
        self.apply(format!("unsubscribe {subscriber}"), ops, tx).await
    }

    /// Everyone subscribed to any of `message_types`, each listed once.
    pub async fn lookup_subscribers(&self, message_types: &[MessageType]) -> Result<Vec<Address>> {
        let keys: Vec<String> = message_types.iter().map(|t| self.set_key(t)).collect();
        let members = self.store.set_union(&keys).await?;

        let mut subscribers = BTreeSet::new();
        for member in members {
            match Address::parse(&member) {
                Ok(address) => {
                    subscribers.insert(address);
                }
                Err(e) => warn!(member = %member, error = %e, "Skipping unparseable subscriber"),
            }
        }
        Ok(subscribers.into_iter().collect())
    }

    fn set_key(&self, message_type: &MessageType) -> String {
        subscription_set_key(&self.prefix, &message_type.type_name, &message_type.version)
    }

    async fn apply(&self, name: String, ops: Vec<StoreOp>, tx: Option<&dyn Enlist>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        match tx {
            Some(tx) => {
                tx.enlist(Box::new(ActionParticipant::batches(
                    name,
                    self.store.clone(),
                    ops,
                    Vec::new(),
                )))
                .await;
            }
            None => {
                self.store.exec(ops).await?;
                debug!(change = %name, "Subscriptions updated");
            }
        }
        Ok(())
    }
}
