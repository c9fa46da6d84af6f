//! In-memory KvStore.
//!
//! Mirrors the Redis semantics the components rely on: empty collections
//! disappear, expired keys read as absent, and a batch is applied to a copy
//! of the keyspace that replaces the original only if every op succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{key_pattern, KvStore, Result, StorageError, StoreOp};

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, i64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

macro_rules! typed_entry {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        /// Live value of this kind, created empty when absent.
        fn $fn_name(&mut self, key: &str) -> Result<&mut $ty> {
            self.purge_if_expired(key);
            let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::$variant(Default::default()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::$variant(v) => Ok(v),
                _ => Err(StorageError::WrongType {
                    key: key.to_string(),
                }),
            }
        }
    };
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&Value> {
        self.purge_if_expired(key);
        self.entries.get(key).map(|e| &e.value)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    typed_entry!(hash_mut, Hash, HashMap<String, Vec<u8>>);
    typed_entry!(list_mut, List, VecDeque<String>);
    typed_entry!(set_mut, Set, BTreeSet<String>);
    typed_entry!(sorted_set_mut, SortedSet, BTreeMap<String, i64>);

    fn apply(&mut self, op: StoreOp) -> Result<()> {
        match op {
            StoreOp::Set { key, value } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: None,
                    },
                );
            }
            StoreOp::SetWithTtl { key, value, ttl } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            }
            StoreOp::Delete { keys } => {
                for key in keys {
                    self.entries.remove(&key);
                }
            }
            StoreOp::HashSetIfAbsent { key, field, value } => {
                self.hash_mut(&key)?.entry(field).or_insert(value);
            }
            StoreOp::HashDelete { key, field } => {
                if self.live(&key).is_some() {
                    self.hash_mut(&key)?.remove(&field);
                    self.drop_if_empty(&key);
                }
            }
            StoreOp::ListPushHead { key, value } => {
                self.list_mut(&key)?.push_front(value);
            }
            StoreOp::ListPushTail { key, value } => {
                self.list_mut(&key)?.push_back(value);
            }
            StoreOp::ListRemove { key, count, value } => {
                if self.live(&key).is_some() {
                    remove_from_list(self.list_mut(&key)?, count, &value);
                    self.drop_if_empty(&key);
                }
            }
            StoreOp::SetAdd { key, member } => {
                self.set_mut(&key)?.insert(member);
            }
            StoreOp::SetRemove { key, member } => {
                if self.live(&key).is_some() {
                    self.set_mut(&key)?.remove(&member);
                    self.drop_if_empty(&key);
                }
            }
            StoreOp::SortedSetAdd { key, score, member } => {
                self.sorted_set_mut(&key)?.insert(member, score);
            }
            StoreOp::SortedSetRemove { key, member } => {
                if self.live(&key).is_some() {
                    self.sorted_set_mut(&key)?.remove(&member);
                    self.drop_if_empty(&key);
                }
            }
        }
        Ok(())
    }
}

/// LREM semantics.
fn remove_from_list(list: &mut VecDeque<String>, count: i64, value: &str) {
    let limit = if count == 0 {
        usize::MAX
    } else {
        count.unsigned_abs() as usize
    };
    let mut removed = 0;

    if count >= 0 {
        let mut i = 0;
        while i < list.len() && removed < limit {
            if list[i] == value {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
    } else {
        let mut i = list.len();
        while i > 0 && removed < limit {
            i -= 1;
            if list[i] == value {
                list.remove(i);
                removed += 1;
            }
        }
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::WrongType {
        key: key.to_string(),
    }
}

/// In-memory store with Redis semantics.
#[derive(Default)]
pub struct InMemoryStore {
    keyspace: Mutex<Keyspace>,
    /// Woken after every batch so blocked movers re-check their source list.
    pushed: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys. Test helper.
    pub async fn key_count(&self) -> usize {
        let mut ks = self.keyspace.lock().await;
        let keys: Vec<String> = ks.entries.keys().cloned().collect();
        keys.iter().filter(|k| ks.live(k).is_some()).count()
    }

    async fn try_move(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(source) {
            None => return Ok(None),
            Some(Value::List(_)) => {}
            Some(_) => return Err(wrong_type(source)),
        }
        if let Some(Value::Str(_) | Value::Hash(_) | Value::Set(_) | Value::SortedSet(_)) =
            ks.live(destination)
        {
            return Err(wrong_type(destination));
        }

        let id = ks.list_mut(source)?.pop_back();
        ks.drop_if_empty(source);
        if let Some(id) = &id {
            ks.list_mut(destination)?.push_front(id.clone());
        }
        Ok(id)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<()> {
        {
            let mut ks = self.keyspace.lock().await;
            let mut staged = ks.clone();
            for op in ops {
                staged.apply(op)?;
            }
            *ks = staged;
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut ks = self.keyspace.lock().await;
        let current = match ks.live(key) {
            None => 0,
            Some(Value::Str(v)) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| StorageError::NotAnInteger {
                    key: key.to_string(),
                })?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + delta;
        let expires_at = ks.entries.get(key).and_then(|e| e.expires_at);
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        Ok(ks.live(key).is_some())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_values(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(h)) => Ok(h.values().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_len(&self, key: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(0),
            Some(Value::Hash(h)) => Ok(h.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(Vec::new()),
            Some(Value::List(l)) => Ok(l.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(0),
            Some(Value::List(l)) => Ok(l.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_move(source, destination).await? {
                return Ok(Some(id));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock().await;
        let mut union = BTreeSet::new();
        for key in keys {
            match ks.live(key) {
                None => {}
                Some(Value::Set(s)) => union.extend(s.iter().cloned()),
                Some(_) => return Err(wrong_type(key)),
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<(String, i64)>> {
        let mut ks = self.keyspace.lock().await;
        match ks.live(key) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(z)) => {
                let mut items: Vec<(String, i64)> = z
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect();
                // Redis orders by score, then lexicographically by member
                items.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(items)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = key_pattern(pattern)?;
        let mut ks = self.keyspace.lock().await;
        let candidates: Vec<String> = ks
            .entries
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|k| ks.live(k).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        if ks.live(key).is_some() {
            return Ok(false);
        }
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(token.as_bytes().to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let held = matches!(ks.live(key), Some(Value::Str(v)) if v.as_slice() == token.as_bytes());
        if held {
            ks.entries.remove(key);
        }
        Ok(held)
    }
}
