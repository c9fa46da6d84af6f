//! Timeout store.
//!
//! One endpoint's timeouts are four keys: a hash of id to record, a sorted
//! set of ids scored by due time, a list of ids, and a hash mapping a
//! correlation (saga) id to the timeout registered for it. Scores are whole
//! seconds since 2000-01-01T00:00:00Z.
//!
//! The correlation map tracks one timeout per correlation id and the first
//! registration wins; later timeouts for the same correlation are stored
//! and fire, but cannot be removed by correlation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::address::Address;
use crate::codec::{base64_bytes, Codec, JsonCodec};
use crate::error::Result;
use crate::keys::TimeoutKeys;
use crate::storage::{KvStore, StoreOp};

/// A scheduled timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutData {
    /// Assigned by [`TimeoutStore::add`].
    #[serde(default)]
    pub id: String,
    /// When the timeout is due.
    pub time: DateTime<Utc>,
    /// Saga the timeout belongs to, if any.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Where the timeout message goes when it fires.
    #[serde(default)]
    pub destination: Option<Address>,
    /// Endpoint that requested the timeout.
    #[serde(default)]
    pub owning_timeout_manager: String,
    #[serde(with = "base64_bytes", default)]
    pub state: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl TimeoutData {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            time,
            correlation_id: None,
            destination: None,
            owning_timeout_manager: String::new(),
            state: Vec::new(),
            headers: HashMap::new(),
        }
    }
}

/// Result of a due-timeout query.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTimeouts {
    /// Due `(id, due time)` pairs, earliest first.
    pub timeouts: Vec<(String, DateTime<Utc>)>,
    /// When to query again.
    pub next_poll: DateTime<Utc>,
}

fn score_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Sorted-set score of a due time.
pub fn score(time: DateTime<Utc>) -> i64 {
    (time - score_epoch()).num_seconds()
}

/// Due time of a sorted-set score.
pub fn time_from_score(score: i64) -> DateTime<Utc> {
    score_epoch() + chrono::Duration::seconds(score)
}

/// Tracks one endpoint's scheduled timeouts.
pub struct TimeoutStore<C: Codec = JsonCodec> {
    store: Arc<dyn KvStore>,
    keys: TimeoutKeys,
    codec: C,
    next_poll: Duration,
}

impl<C: Codec> TimeoutStore<C> {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        endpoint: &str,
        codec: C,
        next_poll: Duration,
    ) -> Self {
        Self {
            store,
            keys: TimeoutKeys::new(prefix, endpoint),
            codec,
            next_poll,
        }
    }

    pub fn keys(&self) -> &TimeoutKeys {
        &self.keys
    }

    /// Register a timeout under a fresh id. Returns the id, which is also
    /// written back into `timeout`.
    pub async fn add(&self, timeout: &mut TimeoutData) -> Result<String> {
        timeout.id = Uuid::new_v4().simple().to_string();
        let id = timeout.id.clone();
        let score = score(timeout.time);

        let mut ops = vec![
            StoreOp::ListPushTail {
                key: self.keys.ids.clone(),
                value: id.clone(),
            },
            StoreOp::HashSetIfAbsent {
                key: self.keys.data.clone(),
                field: id.clone(),
                value: self.codec.encode(timeout)?,
            },
            StoreOp::SortedSetAdd {
                key: self.keys.times.clone(),
                score,
                member: id.clone(),
            },
        ];
        if let Some(correlation_id) = timeout.correlation_id {
            ops.push(StoreOp::HashSetIfAbsent {
                key: self.keys.correlation.clone(),
                field: correlation_id.simple().to_string(),
                value: id.clone().into_bytes(),
            });
        }
        self.store.exec(ops).await?;

        debug!(timeout_id = %id, due = %timeout.time, score, "Timeout added");
        Ok(id)
    }

    /// Timeouts due between `since` and now.
    pub async fn get_due(&self, since: DateTime<Utc>) -> Result<DueTimeouts> {
        let now = Utc::now();
        let due = self
            .store
            .sorted_range_by_score(&self.keys.times, score(since), score(now))
            .await?;

        let next_poll = chrono::Duration::from_std(self.next_poll)
            .map(|offset| now + offset)
            .unwrap_or(now);

        Ok(DueTimeouts {
            timeouts: due
                .into_iter()
                .map(|(id, score)| (id, time_from_score(score)))
                .collect(),
            next_poll,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<TimeoutData>> {
        let payload = self.store.hash_get(&self.keys.data, id).await?;
        match payload {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Remove a timeout, returning it if it was still registered.
    pub async fn try_remove(&self, id: &str) -> Result<Option<TimeoutData>> {
        let Some(timeout) = self.get(id).await? else {
            return Ok(None);
        };

        let correlation = match timeout.correlation_id {
            Some(correlation_id) => {
                let field = correlation_id.simple().to_string();
                let mapped = self.store.hash_get(&self.keys.correlation, &field).await?;
                // Only drop the mapping if it still points at this timeout
                (mapped.as_deref() == Some(id.as_bytes())).then_some(field)
            }
            None => None,
        };

        self.store.exec(self.removal_ops(id, correlation)).await?;
        debug!(timeout_id = %id, "Timeout removed");
        Ok(Some(timeout))
    }

    /// Remove the timeout registered for a correlation id. Returns false
    /// when none is registered.
    pub async fn remove_by_correlation(&self, correlation_id: Uuid) -> Result<bool> {
        let field = correlation_id.simple().to_string();
        let mapped = self.store.hash_get(&self.keys.correlation, &field).await?;
        let Some(id) = mapped.and_then(|id| String::from_utf8(id).ok()) else {
            return Ok(false);
        };

        self.store.exec(self.removal_ops(&id, Some(field))).await?;
        debug!(timeout_id = %id, correlation_id = %correlation_id, "Timeout removed by correlation");
        Ok(true)
    }

    fn removal_ops(&self, id: &str, correlation_field: Option<String>) -> Vec<StoreOp> {
        let mut ops = vec![
            StoreOp::ListRemove {
                key: self.keys.ids.clone(),
                count: 0,
                value: id.to_string(),
            },
            StoreOp::HashDelete {
                key: self.keys.data.clone(),
                field: id.to_string(),
            },
            StoreOp::SortedSetRemove {
                key: self.keys.times.clone(),
                member: id.to_string(),
            },
        ];
        if let Some(field) = correlation_field {
            ops.push(StoreOp::HashDelete {
                key: self.keys.correlation.clone(),
                field,
            });
        }
        ops
    }
}
