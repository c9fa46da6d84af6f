//! Component tests over a real backing store.
//!
//! Queue, saga, timeout and subscription flows exercised end to end against
//! whatever KvStore the caller supplies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use redbus::codec::JsonCodec;
use redbus::config::{AdminConfig, QueueConfig};
use redbus::error::{ConflictReason, Error};
use redbus::keys::{saga_version_key, KeyNameProvider, QueueKeyNameProvider};
use redbus::queue::{headers, Envelope, QueueManager, ReliableQueue};
use redbus::saga::{SagaData, SagaStore};
use redbus::storage::KvStore;
use redbus::subscription::{MessageType, SubscriptionStore};
use redbus::timeout::{TimeoutData, TimeoutStore};
use redbus::transaction::Transaction;
use redbus::Address;

fn queue_config(lease_secs: u64) -> QueueConfig {
    QueueConfig {
        lease_timeout_secs: lease_secs,
        receive_timeout_secs: 1,
        schedule_lease_sweep: false,
        ..Default::default()
    }
}

// =============================================================================
// Reliable queue
// =============================================================================

pub async fn test_queue_send_receive_commit(store: Arc<dyn KvStore>, prefix: &str) {
    let keys = Arc::new(QueueKeyNameProvider::new(prefix, false));
    let queue = ReliableQueue::new(store.clone(), keys.clone(), JsonCodec, queue_config(60));
    let orders = Address::new("orders", "host1");
    queue.init(orders.clone(), true).await;

    let envelope = Envelope::new(b"order".to_vec()).with_id(Uuid::new_v4().to_string());
    queue.send(envelope.clone(), &orders, None).await.unwrap();
    queue.send(envelope.clone(), &orders, None).await.unwrap();

    let ready = keys.message_id_queue_name(&orders);
    let claimed = keys.claimed_message_id_list_name(&orders);
    let hash = keys.message_hash_name(&orders);
    assert_eq!(store.hash_len(&hash).await.unwrap(), 1, "payload stored once");
    assert_eq!(store.list_len(&ready).await.unwrap(), 2, "one ready entry per send");

    let tx = Transaction::new();
    let received = queue.receive(Some(&tx)).await.unwrap().expect("message");
    assert_eq!(received.id, envelope.id);
    assert_eq!(store.list_range(&claimed).await.unwrap(), vec![envelope.id.clone()]);
    assert!(store
        .exists(&keys.message_claim_timeout_key(&orders, &envelope.id))
        .await
        .unwrap());

    tx.commit().await.unwrap();

    assert_eq!(store.list_len(&claimed).await.unwrap(), 0);
    assert_eq!(store.hash_len(&hash).await.unwrap(), 0);
    assert!(!store
        .exists(&keys.message_claim_timeout_key(&orders, &envelope.id))
        .await
        .unwrap());

    // The duplicate ready entry has nothing behind it any more
    assert!(queue.receive(None).await.unwrap().is_none());
    assert_eq!(store.list_len(&ready).await.unwrap(), 0);
    assert_eq!(store.list_len(&claimed).await.unwrap(), 0);
}

pub async fn test_queue_rollback_and_lease_expiry(store: Arc<dyn KvStore>, prefix: &str) {
    let keys = Arc::new(QueueKeyNameProvider::new(prefix, false));
    let queue = ReliableQueue::new(store.clone(), keys.clone(), JsonCodec, queue_config(1));
    let billing = Address::new("billing", "host1");
    queue.init(billing.clone(), true).await;
    let ready = keys.message_id_queue_name(&billing);
    let claimed = keys.claimed_message_id_list_name(&billing);

    let id = queue
        .send(Envelope::new(b"invoice".to_vec()), &billing, None)
        .await
        .unwrap();

    let tx = Transaction::new();
    queue.receive(Some(&tx)).await.unwrap().expect("message");
    tx.rollback().await.unwrap();
    assert_eq!(store.list_range(&ready).await.unwrap(), vec![id.clone()]);
    assert_eq!(store.list_len(&claimed).await.unwrap(), 0);
    assert_eq!(store.hash_len(&keys.message_hash_name(&billing)).await.unwrap(), 1);

    // Claim and abandon
    {
        let tx = Transaction::new();
        queue.receive(Some(&tx)).await.unwrap().expect("message");
    }
    assert_eq!(queue.expire_claimed_messages().await.unwrap(), 0, "lease still held");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(queue.expire_claimed_messages().await.unwrap(), 0, "first sighting only");
    assert_eq!(queue.expire_claimed_messages().await.unwrap(), 1);
    assert_eq!(store.list_range(&ready).await.unwrap(), vec![id.clone()]);
    assert_eq!(store.list_len(&claimed).await.unwrap(), 0);

    let redelivered = queue.receive(None).await.unwrap().expect("message");
    assert_eq!(redelivered.id, id);
}

pub async fn test_queue_no_loss_concurrent_consumers(store: Arc<dyn KvStore>, prefix: &str) {
    let keys = Arc::new(QueueKeyNameProvider::new(prefix, false));
    let shipping = Address::new("shipping", "host1");
    let queue = Arc::new(ReliableQueue::new(
        store.clone(),
        keys.clone(),
        JsonCodec,
        queue_config(60),
    ));
    queue.init(shipping.clone(), true).await;

    let mut sent = HashSet::new();
    for n in 0..20 {
        let id = queue
            .send(Envelope::new(format!("parcel {n}").into_bytes()), &shipping, None)
            .await
            .unwrap();
        sent.insert(id);
    }

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                loop {
                    let tx = Transaction::new();
                    match queue.receive(Some(&tx)).await.unwrap() {
                        Some(envelope) => {
                            tx.commit().await.unwrap();
                            received.push(envelope.id);
                        }
                        None => break,
                    }
                }
                received
            })
        })
        .collect();

    let mut received = Vec::new();
    for consumer in consumers {
        received.extend(consumer.await.unwrap());
    }

    let unique: HashSet<String> = received.iter().cloned().collect();
    assert_eq!(received.len(), sent.len(), "each message delivered once");
    assert_eq!(unique, sent);
    assert_eq!(store.list_len(&keys.message_id_queue_name(&shipping)).await.unwrap(), 0);
    assert_eq!(
        store.list_len(&keys.claimed_message_id_list_name(&shipping)).await.unwrap(),
        0
    );
    assert_eq!(store.hash_len(&keys.message_hash_name(&shipping)).await.unwrap(), 0);
}

pub async fn test_queue_manager_return_to_source(store: Arc<dyn KvStore>, prefix: &str) {
    let keys = Arc::new(QueueKeyNameProvider::new(prefix, false));
    let manager = QueueManager::new(
        store.clone(),
        keys,
        JsonCodec,
        AdminConfig {
            lock_ttl_secs: 10,
            lock_wait_secs: 1,
        },
    );
    let errors = Address::new("error", "host1");
    let orders = Address::new("orders", "host1");

    for _ in 0..3 {
        let failed = Envelope::new(b"x".to_vec()).with_header(headers::FAILED_QUEUE, orders.to_string());
        manager.send_message_to_queue(failed, &errors).await.unwrap();
    }

    let mut queues = manager.get_all_queues().await.unwrap();
    queues.sort();
    assert_eq!(queues, vec![errors.clone()]);

    assert_eq!(manager.return_all_messages_to_source(&errors).await.unwrap(), 3);
    assert_eq!(manager.get_message_count(&errors).await.unwrap(), 0);
    assert_eq!(manager.get_message_count(&orders).await.unwrap(), 3);
    assert_eq!(manager.get_all_messages(&orders).await.unwrap().len(), 3);

    manager.delete_queue(&orders).await.unwrap();
    assert!(manager.get_all_queues().await.unwrap().is_empty());
}

// =============================================================================
// Saga store
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingSaga {
    pub id: Uuid,
    pub version: i64,
    pub tracking_number: String,
}

impl SagaData for ShippingSaga {
    const SAGA_TYPE: &'static str = "ShippingSaga";

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn unique_properties(&self) -> Vec<(&'static str, String)> {
        vec![("tracking_number", self.tracking_number.clone())]
    }
}

pub async fn test_saga_lifecycle(store: Arc<dyn KvStore>, prefix: &str) {
    let sagas = SagaStore::new(store, prefix, JsonCodec);
    let tracking = Uuid::new_v4().to_string();

    let mut saga = ShippingSaga {
        id: Uuid::new_v4(),
        version: 0,
        tracking_number: tracking.clone(),
    };
    sagas.save(&mut saga, None).await.unwrap();
    assert_eq!(saga.version, 1);

    let mut rival = ShippingSaga {
        id: Uuid::new_v4(),
        version: 0,
        tracking_number: tracking.clone(),
    };
    assert!(matches!(
        sagas.save(&mut rival, None).await,
        Err(Error::UniquenessViolation { .. })
    ));

    let mut stale: ShippingSaga = sagas
        .get_by_property("tracking_number", &tracking)
        .await
        .unwrap()
        .expect("saga by property");
    let mut fresh = stale.clone();
    sagas.update(&mut fresh, None).await.unwrap();
    assert_eq!(fresh.version, 2);
    assert!(matches!(
        sagas.update(&mut stale, None).await,
        Err(Error::ConcurrencyConflict {
            reason: ConflictReason::Modified,
            ..
        })
    ));

    sagas.complete(&fresh, None).await.unwrap();
    assert!(sagas.get::<ShippingSaga>(saga.id).await.unwrap().is_none());
    assert!(matches!(
        sagas.update(&mut fresh, None).await,
        Err(Error::ConcurrencyConflict {
            reason: ConflictReason::Deleted,
            ..
        })
    ));
}

pub async fn test_saga_rejected_save_changes_nothing(store: Arc<dyn KvStore>, prefix: &str) {
    let sagas = SagaStore::new(store.clone(), prefix, JsonCodec);
    let taken = Uuid::new_v4().to_string();

    let mut owner = ShippingSaga {
        id: Uuid::new_v4(),
        version: 0,
        tracking_number: taken.clone(),
    };
    sagas.save(&mut owner, None).await.unwrap();
    let mut other = ShippingSaga {
        id: Uuid::new_v4(),
        version: 0,
        tracking_number: Uuid::new_v4().to_string(),
    };
    sagas.save(&mut other, None).await.unwrap();

    let mut clashing: ShippingSaga = sagas.get(other.id).await.unwrap().expect("saga");
    clashing.tracking_number = taken.clone();
    assert!(matches!(
        sagas.update(&mut clashing, None).await,
        Err(Error::UniquenessViolation { .. })
    ));
    assert_eq!(clashing.version, 1);

    let version_key = saga_version_key(prefix, ShippingSaga::SAGA_TYPE, other.id);
    assert_eq!(store.get(&version_key).await.unwrap(), Some(b"1".to_vec()));
    let mut reloaded: ShippingSaga = sagas.get(other.id).await.unwrap().expect("saga");
    assert_eq!(reloaded, other);
    sagas.update(&mut reloaded, None).await.unwrap();
    assert_eq!(reloaded.version, 2);

    let mut newcomer = ShippingSaga {
        id: Uuid::new_v4(),
        version: 0,
        tracking_number: taken,
    };
    assert!(sagas.save(&mut newcomer, None).await.is_err());
    assert_eq!(newcomer.version, 0);
    assert!(!store
        .exists(&saga_version_key(prefix, ShippingSaga::SAGA_TYPE, newcomer.id))
        .await
        .unwrap());

    sagas.complete(&owner, None).await.unwrap();
    sagas.complete(&reloaded, None).await.unwrap();
}

// =============================================================================
// Timeout store
// =============================================================================

pub async fn test_timeout_lifecycle(store: Arc<dyn KvStore>, prefix: &str) {
    let timeouts = TimeoutStore::new(
        store.clone(),
        prefix,
        "billing@host1",
        JsonCodec,
        Duration::from_secs(60),
    );
    let now = Utc::now();
    let saga_id = Uuid::new_v4();

    let mut timeout = TimeoutData::new(now - chrono::Duration::seconds(30));
    timeout.correlation_id = Some(saga_id);
    let id = timeouts.add(&mut timeout).await.unwrap();

    let due = timeouts
        .get_due(now - chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(due.timeouts.len(), 1);
    assert_eq!(due.timeouts[0].0, id);

    assert!(timeouts.try_remove(&id).await.unwrap().is_some());
    let due = timeouts
        .get_due(now - chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert!(due.timeouts.is_empty());

    let keys = timeouts.keys();
    for key in [&keys.ids, &keys.data, &keys.times, &keys.correlation] {
        assert!(!store.exists(key).await.unwrap(), "{key} should be gone");
    }

    let mut again = TimeoutData::new(now);
    again.correlation_id = Some(saga_id);
    timeouts.add(&mut again).await.unwrap();
    assert!(timeouts.remove_by_correlation(saga_id).await.unwrap());
    assert!(!store.exists(&keys.data).await.unwrap());
}

// =============================================================================
// Subscription store
// =============================================================================

pub async fn test_subscriptions(store: Arc<dyn KvStore>, prefix: &str) {
    let subs = SubscriptionStore::new(store, prefix);
    let billing = Address::new("billing", "host1");
    let types = vec![
        MessageType::new("OrderPlaced", "1.0.0"),
        MessageType::new("OrderShipped", "1.0.0"),
        MessageType::new("OrderCancelled", "1.0.0"),
    ];

    subs.subscribe(&billing, &types, None).await.unwrap();
    assert_eq!(
        subs.lookup_subscribers(&types).await.unwrap(),
        vec![billing.clone()]
    );

    subs.unsubscribe(&billing, &types, None).await.unwrap();
    assert!(subs.lookup_subscribers(&types).await.unwrap().is_empty());
}

/// Run all component tests against a store implementation.
#[macro_export]
macro_rules! run_component_tests {
    ($store:expr, $prefix:expr) => {
        use $crate::storage::component_tests::*;

        test_queue_send_receive_commit($store.clone(), $prefix).await;
        println!("  test_queue_send_receive_commit: PASSED");

        test_queue_rollback_and_lease_expiry($store.clone(), $prefix).await;
        println!("  test_queue_rollback_and_lease_expiry: PASSED");

        test_queue_no_loss_concurrent_consumers($store.clone(), $prefix).await;
        println!("  test_queue_no_loss_concurrent_consumers: PASSED");

        test_queue_manager_return_to_source($store.clone(), $prefix).await;
        println!("  test_queue_manager_return_to_source: PASSED");

        test_saga_lifecycle($store.clone(), $prefix).await;
        println!("  test_saga_lifecycle: PASSED");

        test_saga_rejected_save_changes_nothing($store.clone(), $prefix).await;
        println!("  test_saga_rejected_save_changes_nothing: PASSED");

        test_timeout_lifecycle($store.clone(), $prefix).await;
        println!("  test_timeout_lifecycle: PASSED");

        test_subscriptions($store.clone(), $prefix).await;
        println!("  test_subscriptions: PASSED");
    };
}
