use thiserror::Error;

/// Errors surfaced by the queue contract.
///
/// `Transient` and `Backend` both wrap a root cause from the adapter's
/// driver; `Transient` is the subset of those the caller is expected
/// to retry (lock-wait timeouts, pool exhaustion, a dropped
/// connection), while `Backend` covers everything else that made it
/// out of the driver. `Config` is reserved for problems discovered at
/// construction time (missing table, unusable serializer, bad
/// connection string) and is always fatal.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("transient backend error (retry may succeed): {0}")]
    Transient(String),

    #[error("queue configuration error: {0}")]
    Config(String),

    #[error("failed to serialize or deserialize message: {0}")]
    Serialization(#[source] anyhow::Error),

    #[error("queue backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl QueueError {
    /// True if the caller may reasonably retry the same operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        QueueError::Backend(err.into())
    }

    pub fn serialization(err: impl Into<anyhow::Error>) -> Self {
        QueueError::Serialization(err.into())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
