//! Saga store.
//!
//! Each saga record lives under `<prefix>:saga:<type>:<id>` next to two
//! companions: a `:version` counter bumped on every save, and a `:map` set
//! of the unique-property index keys the record owns. Index keys map a
//! hashed property value to the owning saga id.
//!
//! A save writes the record, its new version and its index changes in one
//! batch, so a rejected or failed save leaves nothing behind. Uniqueness is
//! checked before that batch, not inside it: two saves racing on the same
//! property value can both pass the check.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::error::{ConflictReason, Error, Result};
use crate::keys::{saga_key, saga_property_key, saga_property_map_key, saga_version_key};
use crate::storage::{KvStore, StoreOp};
use crate::transaction::{ActionParticipant, Enlist};

/// Saga state persisted by [`SagaStore`].
pub trait SagaData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type name used in key names.
    const SAGA_TYPE: &'static str;

    fn id(&self) -> Uuid;

    /// Version assigned by the last save; zero for a record never saved.
    fn version(&self) -> i64;

    fn set_version(&mut self, version: i64);

    /// `(property, value)` pairs whose value must belong to one saga only.
    fn unique_properties(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Stores saga records with optimistic concurrency.
pub struct SagaStore<C: Codec = JsonCodec> {
    store: Arc<dyn KvStore>,
    prefix: String,
    codec: Arc<C>,
}

impl<C: Codec> SagaStore<C> {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, codec: C) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            codec: Arc::new(codec),
        }
    }

    pub async fn get<S: SagaData>(&self, id: Uuid) -> Result<Option<S>> {
        let payload = self
            .store
            .get(&saga_key(&self.prefix, S::SAGA_TYPE, id))
            .await?;
        match payload {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Look a saga up through one of its unique properties.
    pub async fn get_by_property<S: SagaData>(
        &self,
        property: &str,
        value: &str,
    ) -> Result<Option<S>> {
        let owner = self
            .store
            .get(&saga_property_key(&self.prefix, S::SAGA_TYPE, property, value))
            .await?;
        let Some(owner) = owner else {
            return Ok(None);
        };

        match Uuid::try_parse_ascii(&owner) {
            Ok(id) => self.get(id).await,
            Err(_) => Ok(None),
        }
    }

    /// Save a saga, bumping its version.
    ///
    /// Without a transaction `saga` comes back carrying its new version. A
    /// save that fails, uniqueness included, leaves both the stored record
    /// and `saga` untouched. Index entries for property values the saga no
    /// longer holds are dropped in the same write.
    /// With one, the save runs when the transaction commits and the caller's
    /// copy keeps its old version; uniqueness is also checked up front so a
    /// violation surfaces here rather than at commit.
    pub async fn save<S: SagaData>(&self, saga: &mut S, tx: Option<&dyn Enlist>) -> Result<()> {
        match tx {
            None => save_now(self.store.as_ref(), &self.prefix, self.codec.as_ref(), saga).await,
            Some(tx) => {
                check_unique(self.store.as_ref(), &self.prefix, saga).await?;

                let store = self.store.clone();
                let prefix = self.prefix.clone();
                let codec = self.codec.clone();
                let mut pending = saga.clone();
                tx.enlist(Box::new(ActionParticipant::new(format!(
                    "save saga {}",
                    saga.id()
                ))
                .on_commit(move || async move {
                    save_now(store.as_ref(), &prefix, codec.as_ref(), &mut pending).await
                })))
                .await;
                Ok(())
            }
        }
    }

    /// Save a saga loaded earlier, failing if it changed or vanished since.
    pub async fn update<S: SagaData>(&self, saga: &mut S, tx: Option<&dyn Enlist>) -> Result<()> {
        let stored = stored_version(
            self.store.as_ref(),
            &saga_version_key(&self.prefix, S::SAGA_TYPE, saga.id()),
        )
        .await?;

        match stored {
            None => Err(Error::ConcurrencyConflict {
                saga_id: saga.id(),
                reason: ConflictReason::Deleted,
            }),
            Some(version) if version != saga.version() => Err(Error::ConcurrencyConflict {
                saga_id: saga.id(),
                reason: ConflictReason::Modified,
            }),
            Some(_) => self.save(saga, tx).await,
        }
    }

    /// Delete a saga together with its version counter and index entries.
    pub async fn complete<S: SagaData>(&self, saga: &S, tx: Option<&dyn Enlist>) -> Result<()> {
        let id = saga.id();
        match tx {
            None => delete_now(self.store.as_ref(), &self.prefix, S::SAGA_TYPE, id).await,
            Some(tx) => {
                let store = self.store.clone();
                let prefix = self.prefix.clone();
                tx.enlist(Box::new(
                    ActionParticipant::new(format!("complete saga {id}")).on_commit(
                        move || async move {
                            delete_now(store.as_ref(), &prefix, S::SAGA_TYPE, id).await
                        },
                    ),
                ))
                .await;
                Ok(())
            }
        }
    }
}

async fn check_unique<S: SagaData>(store: &dyn KvStore, prefix: &str, saga: &S) -> Result<()> {
    let own_id = saga.id().simple().to_string();

    for (property, value) in saga.unique_properties() {
        let owner = store
            .get(&saga_property_key(prefix, S::SAGA_TYPE, property, &value))
            .await?;
        if let Some(owner) = owner {
            if owner != own_id.as_bytes() {
                return Err(Error::UniquenessViolation {
                    saga_type: S::SAGA_TYPE.to_string(),
                    property: property.to_string(),
                    value,
                });
            }
        }
    }

    Ok(())
}

async fn stored_version(store: &dyn KvStore, key: &str) -> Result<Option<i64>> {
    let stored = store.get(key).await?;
    Ok(stored
        .as_deref()
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse::<i64>().ok()))
}

async fn save_now<S: SagaData, C: Codec>(
    store: &dyn KvStore,
    prefix: &str,
    codec: &C,
    saga: &mut S,
) -> Result<()> {
    check_unique(store, prefix, saga).await?;

    let id = saga.id();
    let own_id = id.simple().to_string();
    let version_key = saga_version_key(prefix, S::SAGA_TYPE, id);
    let map_key = saga_property_map_key(prefix, S::SAGA_TYPE, id);

    let version = stored_version(store, &version_key).await?.unwrap_or(0) + 1;
    let mut saved = saga.clone();
    saved.set_version(version);
    let payload = codec.encode(&saved)?;

    let owned: Vec<String> = saga
        .unique_properties()
        .into_iter()
        .map(|(property, value)| saga_property_key(prefix, S::SAGA_TYPE, property, &value))
        .collect();

    let mut ops = vec![
        StoreOp::Set {
            key: saga_key(prefix, S::SAGA_TYPE, id),
            value: payload,
        },
        StoreOp::Set {
            key: version_key,
            value: version.to_string().into_bytes(),
        },
    ];

    for stale in store.set_members(&map_key).await? {
        if owned.contains(&stale) {
            continue;
        }
        // Only release an index entry this saga still holds
        if store.get(&stale).await?.as_deref() == Some(own_id.as_bytes()) {
            ops.push(StoreOp::Delete {
                keys: vec![stale.clone()],
            });
        }
        ops.push(StoreOp::SetRemove {
            key: map_key.clone(),
            member: stale,
        });
    }

    for property_key in owned {
        ops.push(StoreOp::SetAdd {
            key: map_key.clone(),
            member: property_key.clone(),
        });
        ops.push(StoreOp::Set {
            key: property_key,
            value: own_id.clone().into_bytes(),
        });
    }
    store.exec(ops).await?;

    saga.set_version(version);
    debug!(saga_type = S::SAGA_TYPE, saga_id = %id, version, "Saga saved");
    Ok(())
}

async fn delete_now(store: &dyn KvStore, prefix: &str, saga_type: &str, id: Uuid) -> Result<()> {
    let map_key = saga_property_map_key(prefix, saga_type, id);
    let mut doomed = store.set_members(&map_key).await?;
    doomed.push(saga_key(prefix, saga_type, id));
    doomed.push(map_key);
    doomed.push(saga_version_key(prefix, saga_type, id));

    store.exec(vec![StoreOp::Delete { keys: doomed }]).await?;

    debug!(saga_type, saga_id = %id, "Saga completed");
    Ok(())
}
