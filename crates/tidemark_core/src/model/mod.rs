//! Record model shared by every synchronized collection.
//!
//! # Responsibility
//! - Define the generic record contract the sync engine operates on.
//! - Provide the concrete entities persisted by the app: task boards,
//!   tasks and notes.
//!
//! # Invariants
//! - Every record is identified by a stable client-generated `RecordId`.
//! - Deletion is represented by soft-delete tombstones, not hard delete.

pub mod note;
pub mod record;
pub mod tags;
pub mod task;
