use reliqueue_core::QueueError;
use sqlite::{Connection, ConnectionThreadSafe, State, Statement};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Wraps a `sqlite` thread-safe connection plus an async mutex
/// guarding the read-then-move sequence that makes up `take`.
///
/// `sqlite` has no `SELECT ... FOR UPDATE SKIP LOCKED`: it is a
/// single-writer embedded engine, not a client/server RDBMS. Per
/// spec.md §9 ("falling back to a short application-level mutex only
/// when the backend cannot express skip-locked semantics"), this
/// mutex serializes the critical section for in-process concurrent
/// consumers; cross-process concurrency still gets sqlite's own file
/// locking underneath.
pub struct SqlConn {
    pub(crate) db: Arc<ConnectionThreadSafe>,
    pub(crate) take_lock: AsyncMutex<()>,
}

impl SqlConn {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, QueueError> {
        let mut db = Connection::open_thread_safe(path)
            .map_err(|err| QueueError::Config(format!("opening sqlite database: {err}")))?;
        db.set_busy_timeout(busy_timeout.as_millis() as usize)
            .map_err(|err| QueueError::Config(format!("setting busy_timeout: {err}")))?;
        Ok(Self {
            db: Arc::new(db),
            take_lock: AsyncMutex::new(()),
        })
    }

    pub fn execute(&self, sql: &str) -> Result<(), QueueError> {
        self.db
            .execute(sql)
            .map_err(|err| QueueError::backend(anyhow::anyhow!("executing `{sql}`: {err}")))
    }
}

pub fn map_sqlite_err(context: &str, err: sqlite::Error) -> QueueError {
    // sqlite's busy/locked codes are the closest thing to a retriable
    // signal this driver surfaces.
    match err.code {
        Some(5) | Some(6) => QueueError::Transient(format!("{context}: {err}")),
        _ => QueueError::backend(anyhow::anyhow!("{context}: {err}")),
    }
}

pub fn bind_text(stmt: &mut Statement, index: usize, value: &str) -> Result<(), QueueError> {
    stmt.bind((index, value))
        .map_err(|err| map_sqlite_err("binding text parameter", err))
}

pub fn bind_i64(stmt: &mut Statement, index: usize, value: i64) -> Result<(), QueueError> {
    stmt.bind((index, value))
        .map_err(|err| map_sqlite_err("binding integer parameter", err))
}

pub fn bind_blob(stmt: &mut Statement, index: usize, value: &[u8]) -> Result<(), QueueError> {
    stmt.bind((index, value))
        .map_err(|err| map_sqlite_err("binding blob parameter", err))
}

pub fn step(stmt: &mut Statement) -> Result<State, QueueError> {
    stmt.next().map_err(|err| map_sqlite_err("stepping statement", err))
}
