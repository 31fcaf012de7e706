//! Mutation API and immediate push for one collection.
//!
//! # Responsibility
//! - Validate and apply saves and soft deletes to the local collection.
//! - Attempt a single best-effort remote write per mutation.
//!
//! # Invariants
//! - A failing validation writes nothing.
//! - Local writes never wait on the network; only `push` talks to the
//!   remote store.
//! - A ledger entry is cleared only after the remote write that covered
//!   exactly that local value succeeded.
//! - `updated_at` never moves backwards for a record.
//! - Remote writes of one engine are serialized and always carry the local
//!   value read under that serialization, so a stale value can never land
//!   after a newer one for the same id.

use crate::config::EngineConfig;
use crate::model::record::{
    new_record_id, resolve_constrained_value, Draft, ParentLookup, ParentSpec, RecordId,
    RecordPatch, RecordStatus, SyncRecord, ValidationError,
};
use crate::store::collection::{Collection, ConfirmedPush};
use crate::store::StoreError;
use crate::sync::env::{AuthSource, Clock, Connectivity, UserIdentity};
use crate::sync::remote::{encode_document, OwnerFilter, RemoteError, RemoteStore};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure of a local mutation. Network failures never show up here.
#[derive(Debug)]
pub enum MutationError {
    Validation(ValidationError),
    Store(StoreError),
}

impl Display for MutationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MutationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<ValidationError> for MutationError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for MutationError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Why a push or reconciliation did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    Unauthenticated,
    NoUser,
    /// Another reconciliation of the same collection is in flight.
    AlreadyRunning,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Unauthenticated => "unauthenticated",
            Self::NoUser => "no_user",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Result of one immediate push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote write succeeded. `cleared` tells whether the ledger entry was
    /// removed; it stays when a newer local change raced in.
    Pushed { cleared: bool },
    Skipped(SkipReason),
    /// Remote write failed; the ledger entry is kept.
    Failed(RemoteError),
    /// No local record at that id.
    Nothing,
}

/// Process-wide collaborators shared by every collection engine.
#[derive(Clone)]
pub struct SyncEnvironment {
    pub remote: Arc<dyn RemoteStore>,
    pub auth: Arc<dyn AuthSource>,
    pub connectivity: Arc<dyn Connectivity>,
    pub clock: Arc<dyn Clock>,
}

/// Sync context for one collection: local state plus collaborators.
pub struct SyncEngine<R: SyncRecord> {
    pub(crate) collection: Arc<Collection<R>>,
    pub(crate) env: SyncEnvironment,
    pub(crate) parents: Option<Arc<dyn ParentLookup>>,
    pub(crate) config: EngineConfig,
    pub(crate) reconciling: AtomicBool,
    push_lock: Mutex<()>,
}

impl<R: SyncRecord> SyncEngine<R> {
    pub fn new(collection: Arc<Collection<R>>, env: SyncEnvironment, config: EngineConfig) -> Self {
        Self {
            collection,
            env,
            parents: None,
            config,
            reconciling: AtomicBool::new(false),
            push_lock: Mutex::new(()),
        }
    }

    /// Sets the lookup used to validate parent references on save.
    pub fn with_parents(mut self, parents: Arc<dyn ParentLookup>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn collection(&self) -> &Arc<Collection<R>> {
        &self.collection
    }

    pub fn env(&self) -> &SyncEnvironment {
        &self.env
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get(&self, id: RecordId) -> Option<R> {
        self.collection.get(id)
    }

    pub fn list(&self, predicate: impl Fn(&R) -> bool) -> Vec<R> {
        self.collection.list(predicate)
    }

    pub fn pending_len(&self) -> usize {
        self.collection.pending_len()
    }

    pub fn last_sync_at(&self) -> i64 {
        self.collection.last_sync_at()
    }

    /// Saves locally, then attempts the immediate push.
    ///
    /// Push failures are logged and leave the ledger entry in place; they
    /// never fail the call.
    pub fn save(&self, parent_id: Option<RecordId>, patch: R::Patch) -> Result<R, MutationError> {
        let record = self.save_local(parent_id, patch)?;
        self.push(record.id());
        Ok(record)
    }

    /// Soft-deletes locally, then attempts the immediate push.
    /// Returns `None` when no record exists at `id`.
    pub fn delete(&self, id: RecordId) -> Result<Option<R>, MutationError> {
        let deleted = self.delete_local(id)?;
        if deleted.is_some() {
            self.push(id);
        }
        Ok(deleted)
    }

    /// Validates and writes a save without touching the network.
    pub fn save_local(&self, parent_id: Option<RecordId>, patch: R::Patch) -> Result<R, MutationError> {
        let id = patch.id().unwrap_or_else(new_record_id);
        let parent = self.resolve_parent(parent_id)?;
        let previous = self.collection.get(id);

        let constrained_value = if R::CONSTRAINED_BY_PARENT {
            let spec = parent.as_ref().ok_or(ValidationError::MissingParent)?;
            let value = resolve_constrained_value(
                patch.constrained_value(),
                previous.as_ref().and_then(|record| record.constrained_value()),
                &spec.allowed_values,
            )
            .ok_or(ValidationError::EmptyConstraintSet(spec.id))?;
            Some(value)
        } else {
            None
        };

        let now = self.next_stamp(previous.as_ref());
        let created_at = previous
            .as_ref()
            .map(|record| record.created_at())
            .filter(|at| *at > 0)
            .unwrap_or(now);
        let record = R::compose(Draft {
            id,
            parent_id: parent.map(|spec| spec.id).or(parent_id),
            previous,
            patch,
            constrained_value,
            created_at,
            updated_at: now,
        });

        self.collection.record_local_change(record.clone(), now)?;
        debug!(
            "event=record_save module=sync status=ok collection={} id={}",
            R::COLLECTION,
            id
        );
        Ok(record)
    }

    /// Tombstones the record at `id` without touching the network.
    pub fn delete_local(&self, id: RecordId) -> Result<Option<R>, MutationError> {
        let Some(mut record) = self.collection.get(id) else {
            debug!(
                "event=record_delete module=sync status=skip collection={} id={} reason=absent",
                R::COLLECTION,
                id
            );
            return Ok(None);
        };

        let now = self.next_stamp(Some(&record));
        record.set_status(RecordStatus::Deleted);
        record.set_updated_at(now);
        self.collection.record_local_change(record.clone(), now)?;
        debug!(
            "event=record_delete module=sync status=ok collection={} id={}",
            R::COLLECTION,
            id
        );
        Ok(Some(record))
    }

    /// Writes the current local value at `id` to the remote store once.
    pub fn push(&self, id: RecordId) -> PushOutcome {
        let user = match self.sync_user() {
            Ok(user) => user,
            Err(reason) => {
                debug!(
                    "event=record_push module=sync status=skip collection={} id={} reason={}",
                    R::COLLECTION,
                    id,
                    reason.as_str()
                );
                return PushOutcome::Skipped(reason);
            }
        };
        let _serialized = self.serialize_pushes();
        let Some((record, entry)) = self.collection.entry(id) else {
            return PushOutcome::Nothing;
        };

        if let Err(err) = self.write_remote(&record, &user) {
            warn!(
                "event=record_push module=sync status=error collection={} id={} error={}",
                R::COLLECTION,
                id,
                err
            );
            return PushOutcome::Failed(err);
        }

        let cleared = match entry {
            Some(entry) => self
                .collection
                .clear_pending_if(&ConfirmedPush { entry, record })
                .unwrap_or_else(|err| {
                    error!(
                        "event=ledger_clear module=sync status=error collection={} id={} error={}",
                        R::COLLECTION,
                        id,
                        err
                    );
                    false
                }),
            None => false,
        };
        info!(
            "event=record_push module=sync status=ok collection={} id={} cleared={}",
            R::COLLECTION,
            id,
            cleared
        );
        PushOutcome::Pushed { cleared }
    }

    /// Checks the shared push/reconcile preconditions in order.
    pub(crate) fn sync_user(&self) -> Result<UserIdentity, SkipReason> {
        if !self.env.connectivity.is_connected() {
            return Err(SkipReason::Offline);
        }
        if !self.env.auth.is_authenticated() {
            return Err(SkipReason::Unauthenticated);
        }
        self.env.auth.current_user().ok_or(SkipReason::NoUser)
    }

    /// Held across "read local value, write remote, clear ledger".
    pub(crate) fn serialize_pushes(&self) -> MutexGuard<'_, ()> {
        self.push_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn owner_filter<'a>(&'a self, user: &'a UserIdentity) -> OwnerFilter<'a> {
        OwnerFilter {
            field: &self.config.owner_field,
            owner: &user.id,
        }
    }

    pub(crate) fn write_remote(&self, record: &R, user: &UserIdentity) -> Result<(), RemoteError> {
        let document = encode_document(record, self.owner_filter(user))?;
        self.env.remote.upsert(R::COLLECTION, record.id(), document)
    }

    fn resolve_parent(&self, parent_id: Option<RecordId>) -> Result<Option<ParentSpec>, ValidationError> {
        if !R::REQUIRES_PARENT && !R::CONSTRAINED_BY_PARENT {
            return Ok(None);
        }
        let parent_id = parent_id.ok_or(ValidationError::MissingParent)?;
        self.parents
            .as_ref()
            .and_then(|parents| parents.parent(parent_id))
            .map(Some)
            .ok_or(ValidationError::ParentNotFound(parent_id))
    }

    fn next_stamp(&self, previous: Option<&R>) -> i64 {
        let now = self.env.clock.now_ms();
        previous
            .and_then(|record| record.updated_at())
            .map_or(now, |last| now.max(last))
    }
}
