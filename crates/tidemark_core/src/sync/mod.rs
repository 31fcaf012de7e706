//! Offline-first synchronization between local collections and the remote
//! store.
//!
//! # Responsibility
//! - Apply user mutations locally and push them best-effort.
//! - Reconcile local and remote state on reconnect and remote change.
//!
//! # Invariants
//! - Network failures never fail a local mutation.
//! - Unmet auth or connectivity preconditions skip work; they are not
//!   errors.

pub mod engine;
pub mod env;
pub mod memory;
pub mod reconcile;
pub mod remote;
pub mod service;
