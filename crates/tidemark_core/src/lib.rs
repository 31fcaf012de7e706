//! Core of Tidemark: offline-first task boards, tasks and notes.
//! Local state is the source of truth for reads; the sync layer converges it
//! with the remote store.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod query;
pub mod store;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::note::{Note, NotePatch};
pub use model::record::{
    ParentLookup, RecordId, RecordPatch, RecordStatus, SyncRecord, ValidationError,
};
pub use model::task::{Task, TaskBoard, TaskBoardPatch, TaskPatch};
pub use store::blob_repo::{BlobRepository, SqliteBlobRepository};
pub use store::collection::{Collection, PendingChange};
pub use store::{StoreError, StoreResult};
pub use sync::engine::{MutationError, PushOutcome, SkipReason, SyncEngine, SyncEnvironment};
pub use sync::env::{
    AuthSource, Clock, Connectivity, ManualClock, ManualConnectivity, StaticAuth, Subscription,
    SystemClock, UserIdentity,
};
pub use sync::memory::MemoryRemote;
pub use sync::reconcile::{ReconcileOutcome, ReconcileReport, SyncError};
pub use sync::remote::{Document, OwnerFilter, RemoteError, RemoteSnapshot, RemoteStore};
pub use sync::service::{SyncService, TriggerReason};

/// Minimal health-check API for embedders.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
