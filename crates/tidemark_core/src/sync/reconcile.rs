//! Pull, merge and push cycle for one collection.
//!
//! # Responsibility
//! - Fetch the user's remote documents and merge them into local state
//!   with last-writer-wins and tombstone precedence.
//! - Push every record that is local-only or still pending.
//!
//! # Invariants
//! - A failed fetch leaves records and ledger untouched.
//! - Runs of the same engine never overlap; a second caller is skipped.
//! - Equal `updated_at` keeps the local fields.
//! - A record mutated locally while a run is in flight keeps the newer
//!   local value and its ledger entry; the run neither writes nor clears it.
//! - A planned push is sent only while the local slot still holds the
//!   planned value.

use crate::model::record::{RecordId, SyncRecord};
use crate::store::collection::{CollectionSnapshot, ConfirmedPush, MergeWrite};
use crate::store::StoreError;
use crate::sync::engine::{SkipReason, SyncEngine};
use crate::sync::remote::{decode_document, overlay_document, RemoteError, RemoteSnapshot};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Top-level reconciliation failure. Per-record push failures are counted
/// in the report instead.
#[derive(Debug)]
pub enum SyncError {
    Fetch(RemoteError),
    Store(StoreError),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(err) => write!(f, "remote fetch failed: {err}"),
            Self::Store(err) => write!(f, "local store failed: {err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fetch(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Counters for one completed reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Remote records that were absent locally.
    pub adopted: usize,
    /// Records present on both sides that were merged and restamped.
    pub merged: usize,
    /// Pending local tombstones kept over the remote copy.
    pub tombstones_kept: usize,
    /// Remote documents skipped because they did not decode.
    pub invalid_documents: usize,
    /// Merges and pushes dropped because a local mutation landed mid-run.
    pub raced: usize,
    pub pushed: usize,
    pub push_failures: usize,
    /// Ledger entries cleared by this run.
    pub cleared: usize,
    /// Ledger entries still present after this run.
    pub retained: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    Skipped(SkipReason),
}

/// Merge result computed from a snapshot, before anything is written.
#[derive(Debug, Clone)]
pub struct MergePlan<R> {
    pub writes: Vec<MergeWrite<R>>,
    /// Values to push: merged value where one was computed, local otherwise.
    pub pushes: Vec<R>,
    pub adopted: usize,
    pub merged: usize,
    pub tombstones_kept: usize,
    pub invalid_documents: usize,
}

/// Computes the merged state of `local` against `remote`.
///
/// Every id present on both sides (except pending local tombstones) is
/// restamped to `merged_at`, whether or not a field changed.
pub fn plan_merge<R: SyncRecord>(
    local: &CollectionSnapshot<R>,
    remote: &RemoteSnapshot,
    owner_field: &str,
    merged_at: i64,
) -> MergePlan<R> {
    let mut plan = MergePlan {
        writes: Vec::new(),
        pushes: Vec::new(),
        adopted: 0,
        merged: 0,
        tombstones_kept: 0,
        invalid_documents: 0,
    };
    let mut merged_values: BTreeMap<RecordId, R> = BTreeMap::new();

    for (id, document) in remote {
        let remote_record = match decode_document::<R>(*id, document, owner_field) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    "event=reconcile_decode module=sync status=skip collection={} id={} error={}",
                    R::COLLECTION,
                    id,
                    err
                );
                plan.invalid_documents += 1;
                continue;
            }
        };

        let Some(local_record) = local.records.get(id) else {
            plan.writes.push(MergeWrite {
                record: remote_record,
                base: None,
            });
            plan.adopted += 1;
            continue;
        };

        if local.pending.contains_key(id) && local_record.status().is_deleted() {
            plan.tombstones_kept += 1;
            continue;
        }

        let remote_is_newer = match (remote_record.updated_at(), local_record.updated_at()) {
            (Some(remote_at), Some(local_at)) => remote_at > local_at,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let mut merged = if remote_is_newer {
            match overlay_document(local_record, document, owner_field) {
                Ok(merged) => merged,
                Err(err) => {
                    warn!(
                        "event=reconcile_merge module=sync status=skip collection={} id={} error={}",
                        R::COLLECTION,
                        id,
                        err
                    );
                    plan.invalid_documents += 1;
                    continue;
                }
            }
        } else {
            local_record.clone()
        };
        merged.set_status(local_record.status().merge(remote_record.status()));
        merged.set_updated_at(merged_at);

        merged_values.insert(*id, merged.clone());
        plan.writes.push(MergeWrite {
            record: merged,
            base: Some(local_record.clone()),
        });
        plan.merged += 1;
    }

    for (id, record) in &local.records {
        if remote.contains_key(id) && !local.pending.contains_key(id) {
            continue;
        }
        let value = merged_values
            .remove(id)
            .unwrap_or_else(|| record.clone());
        plan.pushes.push(value);
    }

    plan
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: SyncRecord> SyncEngine<R> {
    /// Runs one pull, merge and push cycle.
    ///
    /// Unmet preconditions and overlapping runs return
    /// `ReconcileOutcome::Skipped`; they are not errors.
    ///
    /// # Errors
    /// - `Fetch` when the remote snapshot cannot be read. Nothing local
    ///   changes.
    /// - `Store` when merged state cannot be persisted.
    pub fn reconcile(&self) -> Result<ReconcileOutcome, SyncError> {
        let user = match self.sync_user() {
            Ok(user) => user,
            Err(reason) => {
                debug!(
                    "event=reconcile module=sync status=skip collection={} reason={}",
                    R::COLLECTION,
                    reason.as_str()
                );
                return Ok(ReconcileOutcome::Skipped(reason));
            }
        };
        let Some(_guard) = RunGuard::acquire(&self.reconciling) else {
            debug!(
                "event=reconcile module=sync status=skip collection={} reason={}",
                R::COLLECTION,
                SkipReason::AlreadyRunning.as_str()
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let started_at = Instant::now();
        info!(
            "event=reconcile module=sync status=start collection={}",
            R::COLLECTION
        );

        let snapshot = self.collection.snapshot();
        let remote = self
            .env
            .remote
            .query(R::COLLECTION, self.owner_filter(&user))
            .map_err(|err| {
                warn!(
                    "event=reconcile module=sync status=error collection={} stage=fetch error={}",
                    R::COLLECTION,
                    err
                );
                SyncError::Fetch(err)
            })?;

        let plan = plan_merge(
            &snapshot,
            &remote,
            &self.config.owner_field,
            self.env.clock.now_ms(),
        );
        let mut report = ReconcileReport {
            adopted: plan.adopted,
            merged: plan.merged,
            tombstones_kept: plan.tombstones_kept,
            invalid_documents: plan.invalid_documents,
            ..ReconcileReport::default()
        };

        let applied = self.collection.apply_merge(plan.writes)?;
        report.raced = applied.raced.len();

        let mut confirmed = Vec::new();
        for record in plan.pushes {
            let id = record.id();
            if applied.raced.contains(&id) {
                continue;
            }
            let _serialized = self.serialize_pushes();
            let entry = match self.collection.entry(id) {
                Some((current, entry)) if current == record => entry,
                _ => {
                    report.raced += 1;
                    debug!(
                        "event=reconcile_push module=sync status=skip collection={} id={} cause=raced",
                        R::COLLECTION,
                        id
                    );
                    continue;
                }
            };
            match self.write_remote(&record, &user) {
                Ok(()) => {
                    report.pushed += 1;
                    if let Some(entry) = entry {
                        confirmed.push(ConfirmedPush { entry, record });
                    }
                }
                Err(err) => {
                    report.push_failures += 1;
                    warn!(
                        "event=reconcile_push module=sync status=error collection={} id={} error={}",
                        R::COLLECTION,
                        id,
                        err
                    );
                }
            }
        }

        report.cleared = self
            .collection
            .finish_reconciliation(&confirmed, self.env.clock.now_ms())?;
        report.retained = self.collection.pending_len();

        info!(
            "event=reconcile module=sync status=ok collection={} adopted={} merged={} pushed={} push_failures={} cleared={} retained={} raced={} duration_ms={}",
            R::COLLECTION,
            report.adopted,
            report.merged,
            report.pushed,
            report.push_failures,
            report.cleared,
            report.retained,
            report.raced,
            started_at.elapsed().as_millis()
        );
        Ok(ReconcileOutcome::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::plan_merge;
    use crate::model::note::Note;
    use crate::model::record::{new_record_id, RecordId, RecordStatus};
    use crate::store::collection::{CollectionSnapshot, PendingChange};
    use crate::sync::remote::{encode_document, OwnerFilter, RemoteSnapshot};
    use std::collections::BTreeMap;

    const OWNER: OwnerFilter<'static> = OwnerFilter {
        field: "owner_uid",
        owner: "user-1",
    };

    fn note(id: RecordId, title: &str, updated_at: i64) -> Note {
        Note {
            uuid: id,
            title: title.to_string(),
            content: String::new(),
            preview_text: None,
            preview_image: None,
            ends_at: None,
            tags: Vec::new(),
            status: RecordStatus::Active,
            created_at: 1,
            updated_at: Some(updated_at),
        }
    }

    fn snapshot(records: Vec<Note>, pending: &[RecordId]) -> CollectionSnapshot<Note> {
        CollectionSnapshot {
            records: records.into_iter().map(|note| (note.uuid, note)).collect(),
            pending: pending
                .iter()
                .map(|id| (*id, PendingChange { queued_at: 1 }))
                .collect(),
            last_sync_at: 0,
        }
    }

    fn remote(records: Vec<Note>) -> RemoteSnapshot {
        records
            .into_iter()
            .map(|note| (note.uuid, encode_document(&note, OWNER).unwrap()))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn equal_timestamps_keep_local_fields() {
        let id = new_record_id();
        let plan = plan_merge(
            &snapshot(vec![note(id, "local", 5)], &[]),
            &remote(vec![note(id, "remote", 5)]),
            "owner_uid",
            100,
        );
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].record.title, "local");
        assert_eq!(plan.writes[0].record.updated_at, Some(100));
        assert!(plan.pushes.is_empty());
    }

    #[test]
    fn newer_remote_replaces_fields_and_remote_tombstone_propagates() {
        let id = new_record_id();
        let mut remote_note = note(id, "remote", 9);
        remote_note.status = RecordStatus::Deleted;
        let plan = plan_merge(
            &snapshot(vec![note(id, "local", 5)], &[]),
            &remote(vec![remote_note]),
            "owner_uid",
            100,
        );
        let merged = &plan.writes[0].record;
        assert_eq!(merged.title, "remote");
        assert_eq!(merged.status, RecordStatus::Deleted);
    }

    #[test]
    fn older_remote_tombstone_still_deletes_local() {
        let id = new_record_id();
        let mut remote_note = note(id, "remote", 2);
        remote_note.status = RecordStatus::Deleted;
        let plan = plan_merge(
            &snapshot(vec![note(id, "local", 5)], &[]),
            &remote(vec![remote_note]),
            "owner_uid",
            100,
        );
        let merged = &plan.writes[0].record;
        assert_eq!(merged.title, "local");
        assert_eq!(merged.status, RecordStatus::Deleted);
    }

    #[test]
    fn pending_local_tombstone_is_kept_and_pushed() {
        let id = new_record_id();
        let mut local_note = note(id, "local", 5);
        local_note.status = RecordStatus::Deleted;
        let plan = plan_merge(
            &snapshot(vec![local_note.clone()], &[id]),
            &remote(vec![note(id, "edited remotely", 9)]),
            "owner_uid",
            100,
        );
        assert!(plan.writes.is_empty());
        assert_eq!(plan.tombstones_kept, 1);
        assert_eq!(plan.pushes, vec![local_note]);
    }

    #[test]
    fn local_only_and_pending_records_are_pushed_with_merged_values() {
        let local_only = new_record_id();
        let pending = new_record_id();
        let plan = plan_merge(
            &snapshot(
                vec![note(local_only, "draft", 3), note(pending, "edited", 7)],
                &[local_only, pending],
            ),
            &remote(vec![note(pending, "stale", 4)]),
            "owner_uid",
            100,
        );
        let pushed: BTreeMap<RecordId, Note> =
            plan.pushes.into_iter().map(|note| (note.uuid, note)).collect();
        assert_eq!(pushed[&local_only].updated_at, Some(3));
        assert_eq!(pushed[&pending].title, "edited");
        assert_eq!(pushed[&pending].updated_at, Some(100));
    }

    #[test]
    fn undecodable_document_is_skipped() {
        let id = new_record_id();
        let mut documents = RemoteSnapshot::new();
        documents.insert(
            id,
            serde_json::json!({"uuid": "not-a-uuid"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let plan = plan_merge(&snapshot(Vec::new(), &[]), &documents, "owner_uid", 100);
        assert_eq!(plan.invalid_documents, 1);
        assert!(plan.writes.is_empty());
    }
}
