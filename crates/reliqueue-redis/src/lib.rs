//! Key-value backend adapter for the reliable queue contract, built
//! on `redis` the way the teacher's `mod-redis` and `throttle` crates
//! build theirs: a pooled connection manager plus `redis::Script` for
//! the operations that need to touch more than one structure
//! atomically.

mod config;
mod scripts;

pub use config::{EphemeralConfig, RedisQueueConfig};

use deadpool::managed::{Manager, Metrics, Pool, RecycleError, RecycleResult};
use reliqueue_core::{
    BinaryRecordSerializer, EphemeralPolicy, Message, MessageId, Ordering, Queue, QueueError,
    Result, Serializer, StoredRecord, DEFAULT_ORPHAN_BATCH_SIZE,
};
use std::sync::Arc;

/// Wraps a `redis::Client` so `deadpool` can manage a pool of
/// `ConnectionManager`s, following `mod_redis::ClientManager`.
struct RedisManager {
    client: redis::Client,
}

impl Manager for RedisManager {
    type Type = redis::aio::ConnectionManager;
    type Error = anyhow::Error;

    async fn create(&self) -> std::result::Result<Self::Type, Self::Error> {
        Ok(self.client.get_connection_manager().await?)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _metrics: &Metrics,
    ) -> RecycleResult<Self::Error> {
        redis::cmd("PING")
            .query_async::<()>(conn)
            .await
            .map_err(|err| RecycleError::Backend(err.into()))
    }
}

fn backend_err(err: impl std::fmt::Display, context: &str) -> QueueError {
    QueueError::backend(anyhow::anyhow!("{context}: {err}"))
}

/// The key-value adapter: a pending list, a hash of id to encoded
/// record, and a sorted set (score = take-instant millis) tracking
/// ephemeral entries for orphan reclamation.
pub struct RedisQueue {
    pool: Pool<RedisManager>,
    serializer: Arc<dyn Serializer>,
    ordering: Ordering,
    ephemeral_policy: EphemeralPolicy,
    hash: String,
    list: String,
    sorted_set: String,
}

impl RedisQueue {
    pub fn open(config: &RedisQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.node.as_str())
            .map_err(|err| QueueError::Config(format!("parsing redis node `{}`: {err}", config.node)))?;
        let manager = RedisManager { client };
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.unwrap_or(10))
            .build()
            .map_err(|err| QueueError::Config(format!("building redis pool: {err}")))?;

        Ok(Self {
            pool,
            serializer: Arc::new(BinaryRecordSerializer),
            ordering: if config.fifo { Ordering::Fifo } else { Ordering::Lifo },
            ephemeral_policy: EphemeralPolicy::from(&config.ephemeral),
            hash: config.redis_hash_name.clone(),
            list: config.redis_list_name.clone(),
            sorted_set: config.redis_sorted_set_name.clone(),
        })
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        self.serializer.encode(&StoredRecord {
            content: msg.content.clone(),
            origin_timestamp_millis: msg.origin_timestamp.timestamp_millis(),
            timestamp_millis: msg.timestamp.timestamp_millis(),
            num_requeues: msg.num_requeues,
        })
    }

    fn decode(&self, id: &str, bytes: &[u8]) -> Result<Message> {
        let record = self.serializer.decode(bytes)?;
        Ok(Message::from_parts(
            MessageId::from(id.to_string()),
            record.content,
            chrono::DateTime::from_timestamp_millis(record.origin_timestamp_millis)
                .unwrap_or_default(),
            chrono::DateTime::from_timestamp_millis(record.timestamp_millis).unwrap_or_default(),
            record.num_requeues,
        ))
    }

    async fn requeue_impl(&self, msg: Message) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;
        let encoded = self.encode(&msg)?;

        let (_, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(&self.sorted_set, msg.id.as_str())
            .hset(&self.hash, msg.id.as_str(), encoded)
            .rpush(&self.list, msg.id.as_str())
            .query_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "requeue pipeline"))?;

        Ok(true)
    }
}

#[async_trait::async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, msg: Message) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;
        let encoded = self.encode(&msg)?;

        let inserted: i64 = scripts::ENQUEUE_SCRIPT
            .key(&self.hash)
            .key(&self.list)
            .arg(msg.id.as_str())
            .arg(encoded)
            .invoke_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "enqueue script"))?;

        tracing::trace!(id = %msg.id, inserted = inserted == 1, "enqueue");
        Ok(inserted == 1)
    }

    async fn requeue(&self, mut msg: Message) -> Result<bool> {
        msg.mark_requeued();
        tracing::trace!(id = %msg.id, "requeue");
        self.requeue_impl(msg).await
    }

    async fn requeue_silent(&self, msg: Message) -> Result<bool> {
        tracing::trace!(id = %msg.id, "requeue_silent");
        self.requeue_impl(msg).await
    }

    async fn take(&self) -> Result<Option<Message>> {
        if self
            .ephemeral_policy
            .is_at_capacity(self.ephemeral_size().await?)
        {
            tracing::debug!("take: ephemeral storage at capacity");
            return Ok(None);
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;

        let direction = match self.ordering {
            Ordering::Fifo => "L",
            Ordering::Lifo => "R",
        };
        let ephemeral_flag = if self.ephemeral_policy.disabled { "0" } else { "1" };
        let now_millis = chrono::Utc::now().timestamp_millis();

        let reply: Option<(String, Vec<u8>)> = scripts::TAKE_SCRIPT
            .key(&self.list)
            .key(&self.hash)
            .key(&self.sorted_set)
            .arg(direction)
            .arg(now_millis)
            .arg(ephemeral_flag)
            .invoke_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "take script"))?;

        let Some((id, encoded)) = reply else {
            return Ok(None);
        };

        tracing::trace!(%id, "take");
        self.decode(&id, &encoded).map(Some)
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;

        let _: i64 = scripts::FINALIZE_SCRIPT
            .key(&self.sorted_set)
            .key(&self.hash)
            .arg(id)
            .invoke_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "finalize script"))?;
        tracing::trace!(%id, "finalize");
        Ok(())
    }

    async fn orphans(&self, threshold_ms: i64) -> Result<Vec<Message>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;

        let cutoff = chrono::Utc::now().timestamp_millis() - threshold_ms;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.sorted_set)
            .arg("-inf")
            .arg(cutoff)
            .arg("LIMIT")
            .arg(0)
            .arg(DEFAULT_ORPHAN_BATCH_SIZE as i64)
            .query_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "orphan scan"))?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let encoded: Option<Vec<u8>> = redis::cmd("HGET")
                .arg(&self.hash)
                .arg(&id)
                .query_async(&mut *conn)
                .await
                .map_err(|err| backend_err(err, "reading orphan hash entry"))?;
            if let Some(encoded) = encoded {
                out.push(self.decode(&id, &encoded)?);
            }
        }
        tracing::debug!(count = out.len(), threshold_ms, "orphans");
        Ok(out)
    }

    async fn queue_size(&self) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;
        let len: i64 = redis::cmd("LLEN")
            .arg(&self.list)
            .query_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "queue_size"))?;
        Ok(len.max(0) as usize)
    }

    async fn ephemeral_size(&self) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| QueueError::Transient(format!("acquiring redis connection: {err}")))?;
        let len: i64 = redis::cmd("ZCARD")
            .arg(&self.sorted_set)
            .query_async(&mut *conn)
            .await
            .map_err(|err| backend_err(err, "ephemeral_size"))?;
        Ok(len.max(0) as usize)
    }
}

#[cfg(test)]
mod test;
