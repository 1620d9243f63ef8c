use crate::MessageId;
use chrono::{DateTime, Utc};

/// A value flowing through a queue.
///
/// `origin_timestamp` is set once, at first enqueue, and never
/// mutated again (I1: `origin_timestamp <= timestamp` always holds).
/// `timestamp` is refreshed on every enqueue/requeue that isn't
/// "silent". `num_requeues` only moves forward (I2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: Vec<u8>,
    pub origin_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub num_requeues: u64,
}

impl Message {
    /// Builds a brand-new message for first enqueue. If `id` is
    /// `None` a fresh id is assigned.
    pub fn new(id: Option<MessageId>, content: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_default(),
            content,
            origin_timestamp: now,
            timestamp: now,
            num_requeues: 0,
        }
    }

    /// Reconstructs a message from stored fields, e.g. when an
    /// adapter reads a row/hash entry back off the wire.
    pub fn from_parts(
        id: MessageId,
        content: Vec<u8>,
        origin_timestamp: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        num_requeues: u64,
    ) -> Self {
        Self {
            id,
            content,
            origin_timestamp,
            timestamp,
            num_requeues,
        }
    }

    /// Applies the bookkeeping update a non-silent `requeue` performs:
    /// bump `timestamp` to now and increment `num_requeues`.
    pub fn mark_requeued(&mut self) {
        self.timestamp = Utc::now();
        self.num_requeues += 1;
    }
}
