use crate::error::Result;
use crate::Message;
use async_trait::async_trait;

/// The backend-independent queue contract (spec.md §4.1).
///
/// `enqueue`, `requeue` and `requeue_silent` return `Ok(false)` when
/// the commit did not reach queue storage and the caller may retry
/// with the same message instance; they return `Err(_)` only for
/// errors the caller cannot simply retry their way past (see
/// [`crate::QueueError`]).
#[async_trait]
pub trait Queue: Send + Sync {
    /// Appends a new message to queue storage.
    async fn enqueue(&self, msg: Message) -> Result<bool>;

    /// Moves a previously-taken message back to the tail of queue
    /// storage, refreshing its timestamp and incrementing
    /// `num_requeues`.
    async fn requeue(&self, msg: Message) -> Result<bool>;

    /// Same as [`Queue::requeue`] but leaves `timestamp` and
    /// `num_requeues` untouched.
    async fn requeue_silent(&self, msg: Message) -> Result<bool>;

    /// Removes one message from queue storage (FIFO or LIFO depending
    /// on adapter configuration) and, if ephemeral storage is
    /// enabled, records it there before returning it. Returns `None`
    /// when queue storage is empty, or when the ephemeral cap would
    /// be exceeded.
    async fn take(&self) -> Result<Option<Message>>;

    /// Removes `id` from ephemeral storage. Succeeds silently whether
    /// or not the id was present.
    async fn finalize(&self, id: &str) -> Result<()>;

    /// Returns every ephemeral entry whose take-timestamp is older
    /// than `now - threshold_ms`, capped to an implementation-defined
    /// batch size.
    async fn orphans(&self, threshold_ms: i64) -> Result<Vec<Message>>;

    /// Snapshot of queue storage size; may be approximate under
    /// concurrency.
    async fn queue_size(&self) -> Result<usize>;

    /// Snapshot of ephemeral storage size; may be approximate under
    /// concurrency.
    async fn ephemeral_size(&self) -> Result<usize>;
}

/// Default batch size for [`Queue::orphans`], per spec.md §4.1's
/// recommendation.
pub const DEFAULT_ORPHAN_BATCH_SIZE: usize = 100;

/// FIFO vs LIFO delivery discipline, configurable per adapter
/// (spec.md §6, `fifo` option).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Fifo,
    Lifo,
}

impl Ordering {
    pub fn from_fifo_flag(fifo: bool) -> Self {
        if fifo {
            Ordering::Fifo
        } else {
            Ordering::Lifo
        }
    }
}
