//! Bootstrap utilities.
//!
//! Shared initialization for hosts embedding the stores.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::codec::JsonCodec;
use crate::config::{Config, LOG_ENV_VAR};
use crate::error::Result;
use crate::keys::QueueKeyNameProvider;
use crate::queue::{QueueManager, ReliableQueue};
use crate::saga::SagaStore;
use crate::storage::{init_storage, KvStore};
use crate::subscription::SubscriptionStore;
use crate::timeout::TimeoutStore;

/// Initialize tracing with REDBUS_LOG environment variable.
///
/// Defaults to "info" level if REDBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Every store, sharing one backing store.
pub struct Components {
    pub store: Arc<dyn KvStore>,
    pub queue: ReliableQueue,
    pub queue_manager: QueueManager,
    pub sagas: SagaStore,
    /// Present only when `timeouts.endpoint_name` is configured.
    pub timeouts: Option<TimeoutStore>,
    pub subscriptions: SubscriptionStore,
}

/// Connect to the configured store and build every component on it.
pub async fn connect_all(config: &Config) -> Result<Components> {
    let store = init_storage(&config.storage).await?;
    let redis = &config.storage.redis;
    let keys = Arc::new(QueueKeyNameProvider::new(&redis.key_prefix, redis.shared_queues));

    let queue = ReliableQueue::new(store.clone(), keys.clone(), JsonCodec, config.queue.clone());
    let queue_manager = QueueManager::new(store.clone(), keys, JsonCodec, config.admin.clone());
    let sagas = SagaStore::new(store.clone(), redis.key_prefix.clone(), JsonCodec);
    let subscriptions = SubscriptionStore::new(store.clone(), redis.key_prefix.clone());

    let timeouts = match config.timeouts.endpoint_name.as_str() {
        "" => None,
        endpoint => Some(TimeoutStore::new(
            store.clone(),
            &redis.key_prefix,
            endpoint,
            JsonCodec,
            Duration::from_secs(config.timeouts.next_poll_secs),
        )),
    };

    info!(
        storage = ?config.storage.storage_type,
        key_prefix = %redis.key_prefix,
        timeouts = timeouts.is_some(),
        "Components ready"
    );

    Ok(Components {
        store,
        queue,
        queue_manager,
        sagas,
        timeouts,
        subscriptions,
    })
}
