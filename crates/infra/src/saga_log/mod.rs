//! Append-only saga log boundary.
//!
//! The log store is the system's source of truth: every observed event is
//! recorded before it is processed, and in-flight sagas are recovered from it
//! after a restart. This module defines the storage-agnostic contract; the
//! Postgres and in-memory twins live beside it.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySagaLogStore;
pub use postgres::PostgresSagaLogStore;
pub use r#trait::{
    EntryStatus, NewLogEntry, SagaLogEntry, SagaLogError, SagaLogStore, SagaRecord,
};
