use crate::config::SqlLessLockingQueueConfig;
use crate::conn::{bind_blob, bind_i64, bind_text, map_sqlite_err, step, SqlConn};
use chrono::Utc;
use reliqueue_core::{
    EphemeralPolicy, Message, MessageId, Ordering, Queue, QueueError, Result,
};
use sqlite::{ConnectionThreadSafe, State};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// The single-table, less-locking relational adapter (spec.md §4.3,
/// second variant).
///
/// Instead of moving a row between two tables, `take` stamps the row
/// in place with a random `ephemeral_id` token and a refreshed
/// `msg_timestamp`. A pending row has `ephemeral_id IS NULL`; a taken
/// row has it set. This halves the row churn `take`/`finalize` cause
/// at the cost of a wider "pending" predicate on every query, which is
/// the tradeoff spec.md §9 calls out by name.
pub struct SqlLessLockingQueue {
    conn: SqlConn,
    ordering: Ordering,
    ephemeral_policy: EphemeralPolicy,
    table: String,
}

impl SqlLessLockingQueue {
    pub fn open(config: &SqlLessLockingQueueConfig) -> Result<Self> {
        Self::open_at(&config.path, config)
    }

    fn open_at(path: &Path, config: &SqlLessLockingQueueConfig) -> Result<Self> {
        let conn = SqlConn::open(path, config.busy_timeout)?;
        let this = Self {
            conn,
            ordering: Ordering::from_fifo_flag(config.fifo),
            ephemeral_policy: EphemeralPolicy::from(&config.ephemeral),
            table: config.table_name.clone(),
        };
        this.create_schema()?;
        Ok(this)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                queue_id TEXT PRIMARY KEY,
                msg_org_timestamp INTEGER NOT NULL,
                msg_timestamp INTEGER NOT NULL,
                msg_num_requeues INTEGER NOT NULL,
                msg_content BLOB NOT NULL,
                ephemeral_id TEXT UNIQUE
            )",
            self.table
        ))?;
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS {}_pending ON {} (ephemeral_id, msg_timestamp)",
            self.table, self.table
        ))
    }
}

fn millis_to_datetime(millis: i64) -> chrono::DateTime<Utc> {
    chrono::TimeZone::timestamp_millis_opt(&Utc, millis)
        .single()
        .unwrap_or_default()
}

fn row_to_message(id: String, org_ts: i64, ts: i64, num_requeues: i64, content: Vec<u8>) -> Message {
    Message::from_parts(
        MessageId::from(id),
        content,
        millis_to_datetime(org_ts),
        millis_to_datetime(ts),
        num_requeues.max(0) as u64,
    )
}

fn count_pending(db: &ConnectionThreadSafe, table: &str) -> std::result::Result<usize, QueueError> {
    let mut stmt = db
        .prepare(format!(
            "SELECT COUNT(*) FROM {table} WHERE ephemeral_id IS NULL"
        ))
        .map_err(|err| map_sqlite_err("preparing count", err))?;
    step(&mut stmt)?;
    let count: i64 = stmt.read(0).map_err(|err| map_sqlite_err("reading count", err))?;
    Ok(count.max(0) as usize)
}

fn count_ephemeral(db: &ConnectionThreadSafe, table: &str) -> std::result::Result<usize, QueueError> {
    let mut stmt = db
        .prepare(format!(
            "SELECT COUNT(*) FROM {table} WHERE ephemeral_id IS NOT NULL"
        ))
        .map_err(|err| map_sqlite_err("preparing count", err))?;
    step(&mut stmt)?;
    let count: i64 = stmt.read(0).map_err(|err| map_sqlite_err("reading count", err))?;
    Ok(count.max(0) as usize)
}

#[async_trait::async_trait]
impl Queue for SqlLessLockingQueue {
    async fn enqueue(&self, msg: Message) -> Result<bool> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        let id = msg.id.clone();
        let inserted = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut stmt = db
                .prepare(format!(
                    "INSERT INTO {table}
                        (queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content, ephemeral_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL)"
                ))
                .map_err(|err| map_sqlite_err("preparing insert", err))?;
            bind_text(&mut stmt, 1, msg.id.as_str())?;
            bind_i64(&mut stmt, 2, msg.origin_timestamp.timestamp_millis())?;
            bind_i64(&mut stmt, 3, msg.timestamp.timestamp_millis())?;
            bind_i64(&mut stmt, 4, msg.num_requeues as i64)?;
            bind_blob(&mut stmt, 5, &msg.content)?;
            match step(&mut stmt) {
                Ok(_) => Ok(true),
                Err(QueueError::Backend(err)) if err.to_string().contains("UNIQUE") => Ok(false),
                Err(other) => Err(other),
            }
        })
        .await
        .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::trace!(%id, inserted, "enqueue");
        Ok(inserted)
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

        let _guard = self.conn.take_lock.lock().await;
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        let ordering = self.ordering;
        let ephemeral_enabled = !self.ephemeral_policy.disabled;
        let direction = match ordering {
            Ordering::Fifo => "ASC",
            Ordering::Lifo => "DESC",
        };

        let taken = tokio::task::spawn_blocking(move || -> Result<Option<Message>> {
            db.execute("BEGIN IMMEDIATE")
                .map_err(|err| map_sqlite_err("begin", err))?;

            let result = (|| -> Result<Option<Message>> {
                let mut select = db
                    .prepare(format!(
                        "SELECT queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content
                         FROM {table} WHERE ephemeral_id IS NULL
                         ORDER BY msg_timestamp {direction} LIMIT 1"
                    ))
                    .map_err(|err| map_sqlite_err("preparing select", err))?;

                let row = match step(&mut select)? {
                    State::Done => return Ok(None),
                    State::Row => {
                        let id: String = select.read(0).map_err(|err| map_sqlite_err("reading id", err))?;
                        let org_ts: i64 = select
                            .read(1)
                            .map_err(|err| map_sqlite_err("reading org_ts", err))?;
                        let ts: i64 = select.read(2).map_err(|err| map_sqlite_err("reading ts", err))?;
                        let num_requeues: i64 = select
                            .read(3)
                            .map_err(|err| map_sqlite_err("reading num_requeues", err))?;
                        let content: Vec<u8> = select
                            .read(4)
                            .map_err(|err| map_sqlite_err("reading content", err))?;
                        row_to_message(id, org_ts, ts, num_requeues, content)
                    }
                };
                drop(select);

                if !ephemeral_enabled {
                    let mut del = db
                        .prepare(format!("DELETE FROM {table} WHERE queue_id = ?1"))
                        .map_err(|err| map_sqlite_err("preparing delete", err))?;
                    bind_text(&mut del, 1, row.id.as_str())?;
                    step(&mut del)?;
                    return Ok(Some(row));
                }

                let token = Uuid::new_v4().to_string();
                let now_millis = Utc::now().timestamp_millis();
                let mut update = db
                    .prepare(format!(
                        "UPDATE {table} SET ephemeral_id = ?1, msg_timestamp = ?2 WHERE queue_id = ?3"
                    ))
                    .map_err(|err| map_sqlite_err("preparing update", err))?;
                bind_text(&mut update, 1, &token)?;
                bind_i64(&mut update, 2, now_millis)?;
                bind_text(&mut update, 3, row.id.as_str())?;
                step(&mut update)?;

                Ok(Some(row))
            })();

            match &result {
                Ok(_) => db
                    .execute("COMMIT")
                    .map_err(|err| map_sqlite_err("commit", err))?,
                Err(_) => {
                    db.execute("ROLLBACK").ok();
                }
            }
            result
        })
        .await
        .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?;

        if let Ok(Some(msg)) = &taken {
            tracing::trace!(id = %msg.id, "take");
        }
        taken
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut stmt = db
                .prepare(format!(
                    "DELETE FROM {table} WHERE queue_id = ?1 AND ephemeral_id IS NOT NULL"
                ))
                .map_err(|err| map_sqlite_err("preparing delete", err))?;
            bind_text(&mut stmt, 1, &id)?;
            step(&mut stmt)?;
            Ok(())
        })
        .await
        .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::trace!("finalize");
        Ok(())
    }

    async fn orphans(&self, threshold_ms: i64) -> Result<Vec<Message>> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        let cutoff = Utc::now().timestamp_millis() - threshold_ms;

        let out = tokio::task::spawn_blocking(move || -> Result<Vec<Message>> {
            let mut stmt = db
                .prepare(format!(
                    "SELECT queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content
                     FROM {table}
                     WHERE ephemeral_id IS NOT NULL AND msg_timestamp < ?1
                     ORDER BY msg_timestamp ASC
                     LIMIT {}",
                    reliqueue_core::DEFAULT_ORPHAN_BATCH_SIZE
                ))
                .map_err(|err| map_sqlite_err("preparing orphans select", err))?;
            bind_i64(&mut stmt, 1, cutoff)?;

            let mut out = vec![];
            loop {
                match step(&mut stmt)? {
                    State::Done => break,
                    State::Row => {
                        let id: String = stmt.read(0).map_err(|err| map_sqlite_err("reading id", err))?;
                        let org_ts: i64 = stmt
                            .read(1)
                            .map_err(|err| map_sqlite_err("reading org_ts", err))?;
                        let ts: i64 = stmt.read(2).map_err(|err| map_sqlite_err("reading ts", err))?;
                        let num_requeues: i64 = stmt
                            .read(3)
                            .map_err(|err| map_sqlite_err("reading num_requeues", err))?;
                        let content: Vec<u8> = stmt
                            .read(4)
                            .map_err(|err| map_sqlite_err("reading content", err))?;
                        out.push(row_to_message(id, org_ts, ts, num_requeues, content));
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::debug!(count = out.len(), threshold_ms, "orphans");
        Ok(out)
    }

    async fn queue_size(&self) -> Result<usize> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || count_pending(&db, &table))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?
    }

    async fn ephemeral_size(&self) -> Result<usize> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || count_ephemeral(&db, &table))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?
    }
}

impl SqlLessLockingQueue {
    async fn requeue_impl(&self, msg: Message) -> Result<bool> {
        let db = Arc::clone(&self.conn.db);
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || -> Result<bool> {
            db.execute("BEGIN IMMEDIATE")
                .map_err(|err| map_sqlite_err("begin", err))?;

            let result = (|| -> Result<bool> {
                let mut update = db
                    .prepare(format!(
                        "UPDATE {table} SET
                            msg_org_timestamp = ?1,
                            msg_timestamp = ?2,
                            msg_num_requeues = ?3,
                            msg_content = ?4,
                            ephemeral_id = NULL
                         WHERE queue_id = ?5 AND ephemeral_id IS NOT NULL"
                    ))
                    .map_err(|err| map_sqlite_err("preparing update", err))?;
                bind_i64(&mut update, 1, msg.origin_timestamp.timestamp_millis())?;
                bind_i64(&mut update, 2, msg.timestamp.timestamp_millis())?;
                bind_i64(&mut update, 3, msg.num_requeues as i64)?;
                bind_blob(&mut update, 4, &msg.content)?;
                bind_text(&mut update, 5, msg.id.as_str())?;
                step(&mut update)?;

                if db.change_count() > 0 {
                    return Ok(true);
                }

                // Not currently held ephemeral (e.g. after a crash
                // recovery re-enqueue): fall back to a plain insert.
                let mut insert = db
                    .prepare(format!(
                        "INSERT INTO {table}
                            (queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content, ephemeral_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                         ON CONFLICT(queue_id) DO UPDATE SET
                            msg_org_timestamp=excluded.msg_org_timestamp,
                            msg_timestamp=excluded.msg_timestamp,
                            msg_num_requeues=excluded.msg_num_requeues,
                            msg_content=excluded.msg_content,
                            ephemeral_id=NULL"
                    ))
                    .map_err(|err| map_sqlite_err("preparing insert", err))?;
                bind_text(&mut insert, 1, msg.id.as_str())?;
                bind_i64(&mut insert, 2, msg.origin_timestamp.timestamp_millis())?;
                bind_i64(&mut insert, 3, msg.timestamp.timestamp_millis())?;
                bind_i64(&mut insert, 4, msg.num_requeues as i64)?;
                bind_blob(&mut insert, 5, &msg.content)?;
                step(&mut insert)?;
                Ok(true)
            })();

            match &result {
                Ok(_) => db
                    .execute("COMMIT")
                    .map_err(|err| map_sqlite_err("commit", err))?,
                Err(_) => {
                    db.execute("ROLLBACK").ok();
                }
            }
            result
        })
        .await
        .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EphemeralConfig;
    use std::time::Duration as StdDuration;

    fn config(dir: &tempfile::TempDir) -> SqlLessLockingQueueConfig {
        SqlLessLockingQueueConfig {
            path: dir.path().join("queue.db"),
            fifo: true,
            table_name: "queue".to_string(),
            busy_timeout: StdDuration::from_millis(500),
            ephemeral: EphemeralConfig::default(),
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqlLessLockingQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"hi".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        assert_eq!(q.queue_size().await.unwrap(), 0);
        assert_eq!(q.ephemeral_size().await.unwrap(), 1);

        q.finalize(taken.id.as_str()).await.unwrap();
        assert_eq!(q.ephemeral_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqlLessLockingQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"x".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        q.requeue(taken).await.unwrap();

        assert_eq!(q.queue_size().await.unwrap(), 1);
        let again = q.take().await.unwrap().unwrap();
        assert_eq!(again.num_requeues, 1);
    }

    #[tokio::test]
    async fn orphan_predicate_matches_less_locking_schema() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqlLessLockingQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"o".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let orphans = q.orphans(10).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, taken.id);
    }
}
