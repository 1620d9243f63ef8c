//! Backend-independent core of a reliable queue abstraction: the
//! message lifecycle, the queue contract, the ephemeral-storage
//! policy adapters share, and two reference implementations (an
//! in-memory adapter and a bounded in-process ring buffer) that don't
//! need an external store.
//!
//! Backend adapters that do talk to an external store (relational,
//! key-value) live in their own crates (`reliqueue-sql`,
//! `reliqueue-redis`) built on top of the [`Queue`] trait here.

#[cfg(feature = "disruptor")]
pub mod disruptor;
pub mod ephemeral;
mod error;
mod id;
pub mod memory;
mod message;
pub mod queue;
pub mod serializer;

pub use ephemeral::{EnqueueKind, EphemeralPolicy};
pub use error::{QueueError, Result};
pub use id::MessageId;
pub use message::Message;
pub use queue::{Ordering, Queue, DEFAULT_ORPHAN_BATCH_SIZE};

#[cfg(feature = "disruptor")]
pub use disruptor::{DisruptorQueue, DisruptorQueueConfig};
pub use memory::InMemoryQueue;
pub use serializer::{BinaryRecordSerializer, Serializer, StoredRecord};
