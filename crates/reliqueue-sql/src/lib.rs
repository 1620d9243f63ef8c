//! Relational backend adapters for the reliable queue contract,
//! built on the embedded `sqlite` engine the teacher's `mod-sqlite`
//! wraps for its own on-disk spooling needs.
//!
//! Two schema variants are offered, matching spec.md §4.3: a two-table
//! variant (simple, one extra row move per take/requeue) and a
//! single-table "less locking" variant (fewer row moves, wider
//! predicates).

mod conn;
mod config;
mod less_locking;
mod two_table;

pub use config::{EphemeralConfig, SqlLessLockingQueueConfig, SqlQueueConfig};
pub use less_locking::SqlLessLockingQueue;
pub use two_table::TwoTableQueue;
