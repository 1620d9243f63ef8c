use crate::conn::{bind_blob, bind_i64, bind_text, map_sqlite_err, step, SqlConn};
use crate::config::SqlQueueConfig;
use chrono::{TimeZone, Utc};
use reliqueue_core::{EnqueueKind, EphemeralPolicy, Message, MessageId, Ordering, QueueError, Queue, Result};
use sqlite::{ConnectionThreadSafe, State};
use std::path::Path;
use std::sync::Arc;

/// The two-table relational adapter (spec.md §4.3).
///
/// One table holds pending messages, a second, identically-shaped
/// table holds taken-but-not-finalized messages. `take` moves a row
/// from the former to the latter inside one transaction; `requeue`
/// moves it back. Built on the same `sqlite` engine the teacher's
/// `mod-sqlite` wraps.
pub struct TwoTableQueue {
    conn: SqlConn,
    ordering: Ordering,
    ephemeral_policy: EphemeralPolicy,
    queue_table: String,
    ephemeral_table: String,
}

impl TwoTableQueue {
    pub fn open(config: &SqlQueueConfig) -> Result<Self> {
        Self::open_at(&config.path, config)
    }

    fn open_at(path: &Path, config: &SqlQueueConfig) -> Result<Self> {
        let conn = SqlConn::open(path, config.busy_timeout)?;
        let this = Self {
            conn,
            ordering: Ordering::from_fifo_flag(config.fifo),
            ephemeral_policy: EphemeralPolicy::from(&config.ephemeral),
            queue_table: config.table_name.clone(),
            ephemeral_table: config.table_name_ephemeral.clone(),
        };
        this.create_schema()?;
        Ok(this)
    }

    fn create_schema(&self) -> Result<()> {
        for table in [&self.queue_table, &self.ephemeral_table] {
            self.conn.execute(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    queue_id TEXT PRIMARY KEY,
                    msg_org_timestamp INTEGER NOT NULL,
                    msg_timestamp INTEGER NOT NULL,
                    msg_num_requeues INTEGER NOT NULL,
                    msg_content BLOB NOT NULL
                )"
            ))?;
        }
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS {}_ts ON {} (msg_timestamp)",
            self.queue_table, self.queue_table
        ))?;
        self.conn.execute(&format!(
            "CREATE INDEX IF NOT EXISTS {}_ts ON {} (msg_timestamp)",
            self.ephemeral_table, self.ephemeral_table
        ))
    }
}

fn millis_to_datetime(millis: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
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

fn insert_row(
    db: &ConnectionThreadSafe,
    table: &str,
    msg: &Message,
) -> std::result::Result<(), QueueError> {
    let sql = format!(
        "INSERT INTO {table}
            (queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(queue_id) DO UPDATE SET
            msg_org_timestamp=excluded.msg_org_timestamp,
            msg_timestamp=excluded.msg_timestamp,
            msg_num_requeues=excluded.msg_num_requeues,
            msg_content=excluded.msg_content"
    );
    let mut stmt = db
        .prepare(&sql)
        .map_err(|err| map_sqlite_err("preparing insert", err))?;
    bind_text(&mut stmt, 1, msg.id.as_str())?;
    bind_i64(&mut stmt, 2, msg.origin_timestamp.timestamp_millis())?;
    bind_i64(&mut stmt, 3, msg.timestamp.timestamp_millis())?;
    bind_i64(&mut stmt, 4, msg.num_requeues as i64)?;
    bind_blob(&mut stmt, 5, &msg.content)?;
    step(&mut stmt)?;
    Ok(())
}

fn insert_new_row(
    db: &ConnectionThreadSafe,
    table: &str,
    msg: &Message,
) -> std::result::Result<bool, QueueError> {
    let sql = format!(
        "INSERT INTO {table}
            (queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content)
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    let mut stmt = db
        .prepare(&sql)
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
}

fn delete_row(db: &ConnectionThreadSafe, table: &str, id: &str) -> std::result::Result<(), QueueError> {
    let mut stmt = db
        .prepare(format!("DELETE FROM {table} WHERE queue_id = ?1"))
        .map_err(|err| map_sqlite_err("preparing delete", err))?;
    bind_text(&mut stmt, 1, id)?;
    step(&mut stmt)?;
    Ok(())
}

fn count_rows(db: &ConnectionThreadSafe, table: &str) -> std::result::Result<usize, QueueError> {
    let mut stmt = db
        .prepare(format!("SELECT COUNT(*) FROM {table}"))
        .map_err(|err| map_sqlite_err("preparing count", err))?;
    step(&mut stmt)?;
    let count: i64 = stmt.read(0).map_err(|err| map_sqlite_err("reading count", err))?;
    Ok(count.max(0) as usize)
}

fn select_oldest(
    db: &ConnectionThreadSafe,
    table: &str,
    ordering: Ordering,
) -> std::result::Result<Option<Message>, QueueError> {
    let direction = match ordering {
        Ordering::Fifo => "ASC",
        Ordering::Lifo => "DESC",
    };
    let mut stmt = db
        .prepare(format!(
            "SELECT queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content
             FROM {table} ORDER BY msg_timestamp {direction} LIMIT 1"
        ))
        .map_err(|err| map_sqlite_err("preparing select", err))?;
    match step(&mut stmt)? {
        State::Done => Ok(None),
        State::Row => {
            let id: String = stmt.read(0).map_err(|err| map_sqlite_err("reading id", err))?;
            let org_ts: i64 = stmt.read(1).map_err(|err| map_sqlite_err("reading org_ts", err))?;
            let ts: i64 = stmt.read(2).map_err(|err| map_sqlite_err("reading ts", err))?;
            let num_requeues: i64 = stmt
                .read(3)
                .map_err(|err| map_sqlite_err("reading num_requeues", err))?;
            let content: Vec<u8> = stmt
                .read(4)
                .map_err(|err| map_sqlite_err("reading content", err))?;
            Ok(Some(row_to_message(id, org_ts, ts, num_requeues, content)))
        }
    }
}

fn select_orphans(
    db: &ConnectionThreadSafe,
    table: &str,
    cutoff_millis: i64,
) -> std::result::Result<Vec<Message>, QueueError> {
    let mut stmt = db
        .prepare(format!(
            "SELECT queue_id, msg_org_timestamp, msg_timestamp, msg_num_requeues, msg_content
             FROM {table} WHERE msg_timestamp < ?1 ORDER BY msg_timestamp ASC
             LIMIT {}",
            reliqueue_core::DEFAULT_ORPHAN_BATCH_SIZE
        ))
        .map_err(|err| map_sqlite_err("preparing orphans select", err))?;
    bind_i64(&mut stmt, 1, cutoff_millis)?;

    let mut out = vec![];
    loop {
        match step(&mut stmt)? {
            State::Done => break,
            State::Row => {
                let id: String = stmt.read(0).map_err(|err| map_sqlite_err("reading id", err))?;
                let org_ts: i64 = stmt.read(1).map_err(|err| map_sqlite_err("reading org_ts", err))?;
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
}

#[async_trait::async_trait]
impl Queue for TwoTableQueue {
    async fn enqueue(&self, msg: Message) -> Result<bool> {
        let db = Arc::clone(&self.conn.db);
        let table = self.queue_table.clone();
        let id = msg.id.clone();
        let inserted = tokio::task::spawn_blocking(move || insert_new_row(&db, &table, &msg))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::trace!(%id, inserted, "enqueue");
        Ok(inserted)
    }

    async fn requeue(&self, mut msg: Message) -> Result<bool> {
        msg.mark_requeued();
        tracing::trace!(id = %msg.id, "requeue");
        self.requeue_impl(msg, EnqueueKind::Requeue).await
    }

    async fn requeue_silent(&self, msg: Message) -> Result<bool> {
        tracing::trace!(id = %msg.id, "requeue_silent");
        self.requeue_impl(msg, EnqueueKind::RequeueSilent).await
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
        let queue_table = self.queue_table.clone();
        let ephemeral_table = self.ephemeral_table.clone();
        let ordering = self.ordering;
        let ephemeral_enabled = !self.ephemeral_policy.disabled;

        let taken = tokio::task::spawn_blocking(move || -> Result<Option<Message>> {
            db.execute("BEGIN IMMEDIATE")
                .map_err(|err| map_sqlite_err("begin", err))?;

            let result = (|| -> Result<Option<Message>> {
                let Some(msg) = select_oldest(&db, &queue_table, ordering)? else {
                    return Ok(None);
                };

                if ephemeral_enabled {
                    let mut taken = msg.clone();
                    taken.timestamp = Utc::now();
                    insert_row(&db, &ephemeral_table, &taken)?;
                }
                delete_row(&db, &queue_table, msg.id.as_str())?;
                Ok(Some(msg))
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
        let table = self.ephemeral_table.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || delete_row(&db, &table, &id))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::trace!("finalize");
        Ok(())
    }

    async fn orphans(&self, threshold_ms: i64) -> Result<Vec<Message>> {
        let db = Arc::clone(&self.conn.db);
        let table = self.ephemeral_table.clone();
        let cutoff = Utc::now().timestamp_millis() - threshold_ms;
        let out = tokio::task::spawn_blocking(move || select_orphans(&db, &table, cutoff))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))??;
        tracing::debug!(count = out.len(), threshold_ms, "orphans");
        Ok(out)
    }

    async fn queue_size(&self) -> Result<usize> {
        let db = Arc::clone(&self.conn.db);
        let table = self.queue_table.clone();
        tokio::task::spawn_blocking(move || count_rows(&db, &table))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?
    }

    async fn ephemeral_size(&self) -> Result<usize> {
        let db = Arc::clone(&self.conn.db);
        let table = self.ephemeral_table.clone();
        tokio::task::spawn_blocking(move || count_rows(&db, &table))
            .await
            .map_err(|err| QueueError::backend(anyhow::anyhow!("join error: {err}")))?
    }
}

impl TwoTableQueue {
    async fn requeue_impl(&self, msg: Message, kind: EnqueueKind) -> Result<bool> {
        let db = Arc::clone(&self.conn.db);
        let queue_table = self.queue_table.clone();
        let ephemeral_table = self.ephemeral_table.clone();
        let kind = self.ephemeral_policy.resolve_kind(kind);

        tokio::task::spawn_blocking(move || -> Result<bool> {
            db.execute("BEGIN IMMEDIATE")
                .map_err(|err| map_sqlite_err("begin", err))?;

            let result = (|| -> Result<bool> {
                if matches!(kind, EnqueueKind::Requeue | EnqueueKind::RequeueSilent) {
                    delete_row(&db, &ephemeral_table, msg.id.as_str())?;
                }
                insert_new_row(&db, &queue_table, &msg)
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

    fn config(dir: &tempfile::TempDir) -> SqlQueueConfig {
        SqlQueueConfig {
            path: dir.path().join("queue.db"),
            fifo: true,
            table_name: "queue".to_string(),
            table_name_ephemeral: "queue_ephemeral".to_string(),
            busy_timeout: StdDuration::from_millis(500),
            ephemeral: EphemeralConfig::default(),
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let q = TwoTableQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"hello".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        assert_eq!(taken.content, b"hello");
        assert_eq!(taken.num_requeues, 0);

        q.finalize(taken.id.as_str()).await.unwrap();
        assert_eq!(q.queue_size().await.unwrap(), 0);
        assert_eq!(q.ephemeral_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_increments_count() {
        let dir = tempfile::tempdir().unwrap();
        let q = TwoTableQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"x".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        q.requeue(taken).await.unwrap();

        let second = q.take().await.unwrap().unwrap();
        assert_eq!(second.num_requeues, 1);
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let q = TwoTableQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"a".to_vec())).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(2)).await;
        q.enqueue(Message::new(None, b"b".to_vec())).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(2)).await;
        q.enqueue(Message::new(None, b"c".to_vec())).await.unwrap();

        let a = q.take().await.unwrap().unwrap();
        let b = q.take().await.unwrap().unwrap();
        let c = q.take().await.unwrap().unwrap();
        assert_eq!(a.content, b"a");
        assert_eq!(b.content, b"b");
        assert_eq!(c.content, b"c");
    }

    #[tokio::test]
    async fn orphan_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let q = TwoTableQueue::open(&config(&dir)).unwrap();

        q.enqueue(Message::new(None, b"orph".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let orphans = q.orphans(10).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, taken.id);

        q.requeue(orphans[0].clone()).await.unwrap();
        let again = q.take().await.unwrap().unwrap();
        assert_eq!(again.content, b"orph");
    }

    #[tokio::test]
    async fn cap_pushback() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.ephemeral.ephemeral_max_size = Some(2);
        let q = TwoTableQueue::open(&cfg).unwrap();

        for i in 0..4u8 {
            q.enqueue(Message::new(None, vec![i])).await.unwrap();
        }
        let t1 = q.take().await.unwrap().unwrap();
        let _t2 = q.take().await.unwrap().unwrap();
        assert!(q.take().await.unwrap().is_none());

        q.finalize(t1.id.as_str()).await.unwrap();
        assert!(q.take().await.unwrap().is_some());
    }
}
