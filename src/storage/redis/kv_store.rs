//! Redis KvStore implementation.
//!
//! Batches go out as MULTI/EXEC pipelines. Blocking list moves run on
//! dedicated connections so a 30 second BRPOPLPUSH never stalls the shared
//! multiplexed connection used by everything else.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::{KvStore, Result, StoreOp};

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed store.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    /// Idle connections reserved for blocking commands.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    unlock_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!("Opening dedicated Redis connection for blocking commands");
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }

    fn queue_op(pipe: &mut redis::Pipeline, op: StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            StoreOp::SetWithTtl { key, value, ttl } => {
                // PX needs at least one millisecond
                let millis = ttl.as_millis().max(1) as u64;
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .ignore();
            }
            StoreOp::Delete { keys } => {
                if !keys.is_empty() {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
            }
            StoreOp::HashSetIfAbsent { key, field, value } => {
                pipe.cmd("HSETNX").arg(key).arg(field).arg(value).ignore();
            }
            StoreOp::HashDelete { key, field } => {
                pipe.cmd("HDEL").arg(key).arg(field).ignore();
            }
            StoreOp::ListPushHead { key, value } => {
                pipe.cmd("LPUSH").arg(key).arg(value).ignore();
            }
            StoreOp::ListPushTail { key, value } => {
                pipe.cmd("RPUSH").arg(key).arg(value).ignore();
            }
            StoreOp::ListRemove { key, count, value } => {
                pipe.cmd("LREM").arg(key).arg(count).arg(value).ignore();
            }
            StoreOp::SetAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
            }
            StoreOp::SetRemove { key, member } => {
                pipe.cmd("SREM").arg(key).arg(member).ignore();
            }
            StoreOp::SortedSetAdd { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
            }
            StoreOp::SortedSetRemove { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member).ignore();
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn exec(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let count = ops.len();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            Self::queue_op(&mut pipe, op);
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(ops = count, "Executed atomic batch");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, delta).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_values(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.hvals(key).await?)
    }

    async fn hash_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(key).await?)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.checkout_blocking().await?;

        let result: redis::RedisResult<Option<String>> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await;

        // A failed connection is dropped rather than returned to the pool
        match result {
            Ok(id) => {
                self.checkin_blocking(conn).await;
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(conn.sunion(keys).await?)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn.clone();
        let items: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, min, max).await?;
        Ok(items
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();

        // Use SCAN to find matching keys (non-blocking iteration)
        let mut cursor = 0u64;
        let mut keys: Vec<String> = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            cursor = next_cursor;

            if cursor == 0 {
                break;
            }
        }

        // SCAN may report a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
