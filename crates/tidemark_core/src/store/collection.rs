//! Record store and pending-change ledger for one collection.
//!
//! # Responsibility
//! - Serve local reads (`get`, `list`) without touching the network.
//! - Apply local writes, merge results and ledger updates as single
//!   persisted state transitions.
//!
//! # Invariants
//! - Each write clones the current state, mutates the clone, persists it and
//!   only then swaps it in. Readers never see a half-applied write and a
//!   failed persist leaves the previous state untouched.
//! - A ledger entry is removed only when both the entry and the record value
//!   still match what was confirmed remotely.
//! - Records are never removed; deletion is a tombstone written by `upsert`.

use crate::model::record::{ParentLookup, ParentRecord, ParentSpec, RecordId, SyncRecord};
use crate::store::blob_repo::BlobRepository;
use crate::store::{StoreError, StoreResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Ledger entry: local state at this id is not yet confirmed remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Epoch milliseconds of the local mutation that queued this entry.
    pub queued_at: i64,
}

/// Persisted blob layout of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "R: SyncRecord")]
struct CollectionState<R> {
    #[serde(default)]
    records: BTreeMap<RecordId, R>,
    #[serde(default)]
    pending: BTreeMap<RecordId, PendingChange>,
    #[serde(default)]
    last_sync_at: i64,
}

impl<R> Default for CollectionState<R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_sync_at: 0,
        }
    }
}

/// Point-in-time copy of records and ledger taken by the reconciler.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot<R> {
    pub records: BTreeMap<RecordId, R>,
    pub pending: BTreeMap<RecordId, PendingChange>,
    pub last_sync_at: i64,
}

/// One merged record plus the local value the merge was computed from.
#[derive(Debug, Clone)]
pub struct MergeWrite<R> {
    pub record: R,
    /// `None` when the record was adopted from remote.
    pub base: Option<R>,
}

/// Successful remote write of `record` while `entry` was queued.
#[derive(Debug, Clone)]
pub struct ConfirmedPush<R> {
    pub entry: PendingChange,
    pub record: R,
}

/// Outcome of applying merged records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeApplied {
    pub written: Vec<RecordId>,
    /// Ids left untouched because a local mutation landed after the snapshot.
    pub raced: Vec<RecordId>,
}

/// Local record store and ledger for records of type `R`.
pub struct Collection<R: SyncRecord> {
    name: String,
    blobs: Arc<dyn BlobRepository>,
    state: RwLock<CollectionState<R>>,
}

impl<R: SyncRecord> Collection<R> {
    /// Loads the collection stored under `R::COLLECTION`.
    pub fn load(blobs: Arc<dyn BlobRepository>) -> StoreResult<Self> {
        Self::load_named(blobs, R::COLLECTION)
    }

    /// Loads the collection stored under an explicit blob name.
    ///
    /// # Errors
    /// - `InvalidData` when the blob does not decode or a record is stored
    ///   under an id that differs from its own.
    pub fn load_named(blobs: Arc<dyn BlobRepository>, name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        let mut state = match blobs.load(&name)? {
            Some(payload) => serde_json::from_str::<CollectionState<R>>(&payload)
                .map_err(|err| StoreError::InvalidData(format!("collection `{name}`: {err}")))?,
            None => CollectionState::default(),
        };

        if let Some((key, record)) = state.records.iter().find(|(key, record)| **key != record.id())
        {
            return Err(StoreError::InvalidData(format!(
                "collection `{name}` stores record {} under key {key}",
                record.id()
            )));
        }

        let records = &state.records;
        let before = state.pending.len();
        state.pending.retain(|id, _| records.contains_key(id));
        if state.pending.len() != before {
            warn!(
                "event=collection_load module=store status=repaired collection={} dropped_orphan_pending={}",
                name,
                before - state.pending.len()
            );
        }

        info!(
            "event=collection_load module=store status=ok collection={} records={} pending={}",
            name,
            state.records.len(),
            state.pending.len()
        );

        Ok(Self {
            name,
            blobs,
            state: RwLock::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the record at `id`, tombstones included.
    pub fn get(&self, id: RecordId) -> Option<R> {
        self.read(|state| state.records.get(&id).cloned())
    }

    /// Returns all records matching `predicate`, in id order.
    pub fn list(&self, predicate: impl Fn(&R) -> bool) -> Vec<R> {
        self.read(|state| {
            state
                .records
                .values()
                .filter(|record| predicate(record))
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.read(|state| state.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the ledger entry for `id`.
    pub fn pending_entry(&self, id: RecordId) -> Option<PendingChange> {
        self.read(|state| state.pending.get(&id).copied())
    }

    pub fn pending_len(&self) -> usize {
        self.read(|state| state.pending.len())
    }

    /// Epoch milliseconds of the last completed reconciliation, 0 if never.
    pub fn last_sync_at(&self) -> i64 {
        self.read(|state| state.last_sync_at)
    }

    /// Returns the record at `id` together with its ledger entry, read under
    /// one lock.
    pub fn entry(&self, id: RecordId) -> Option<(R, Option<PendingChange>)> {
        self.read(|state| {
            state
                .records
                .get(&id)
                .map(|record| (record.clone(), state.pending.get(&id).copied()))
        })
    }

    pub fn snapshot(&self) -> CollectionSnapshot<R> {
        self.read(|state| CollectionSnapshot {
            records: state.records.clone(),
            pending: state.pending.clone(),
            last_sync_at: state.last_sync_at,
        })
    }

    /// Overwrites the slot at `record.id()`. Leaves the ledger untouched.
    pub fn upsert(&self, record: R) -> StoreResult<()> {
        self.write(|state| {
            state.records.insert(record.id(), record);
            ((), true)
        })
    }

    /// Overwrites several slots in one persisted transition.
    pub fn upsert_many(&self, records: impl IntoIterator<Item = R>) -> StoreResult<usize> {
        let records: Vec<R> = records.into_iter().collect();
        if records.is_empty() {
            return Ok(0);
        }
        self.write(|state| {
            let count = records.len();
            for record in records {
                state.records.insert(record.id(), record);
            }
            (count, true)
        })
    }

    /// Writes a locally mutated record and refreshes its ledger entry.
    pub fn record_local_change(&self, record: R, queued_at: i64) -> StoreResult<PendingChange> {
        let entry = PendingChange { queued_at };
        self.write(|state| {
            state.pending.insert(record.id(), entry);
            state.records.insert(record.id(), record);
            (entry, true)
        })
    }

    /// Removes the ledger entry for a confirmed push if nothing newer was
    /// queued since. Returns whether the entry was removed.
    pub fn clear_pending_if(&self, confirmed: &ConfirmedPush<R>) -> StoreResult<bool> {
        self.write(|state| {
            let cleared = clear_confirmed(state, confirmed);
            (cleared, cleared)
        })
    }

    /// Writes merged records, skipping any id whose local value changed
    /// after the merge base was read.
    pub fn apply_merge(&self, writes: Vec<MergeWrite<R>>) -> StoreResult<MergeApplied> {
        if writes.is_empty() {
            return Ok(MergeApplied::default());
        }
        self.write(|state| {
            let mut applied = MergeApplied::default();
            for MergeWrite { record, base } in writes {
                let id = record.id();
                if state.records.get(&id) != base.as_ref() {
                    applied.raced.push(id);
                    continue;
                }
                state.records.insert(id, record);
                applied.written.push(id);
            }
            let dirty = !applied.written.is_empty();
            (applied, dirty)
        })
    }

    /// Clears confirmed ledger entries and stamps the completion time.
    /// Returns the number of entries removed.
    pub fn finish_reconciliation(
        &self,
        confirmed: &[ConfirmedPush<R>],
        synced_at: i64,
    ) -> StoreResult<usize> {
        self.write(|state| {
            let cleared = confirmed
                .iter()
                .filter(|push| clear_confirmed(state, push))
                .count();
            state.last_sync_at = synced_at;
            (cleared, true)
        })
    }

    fn read<T>(&self, view: impl FnOnce(&CollectionState<R>) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        view(&guard)
    }

    fn write<T>(&self, mutate: impl FnOnce(&mut CollectionState<R>) -> (T, bool)) -> StoreResult<T> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let (output, dirty) = mutate(&mut next);
        if dirty {
            let payload = serde_json::to_string(&next)?;
            self.blobs.save(&self.name, &payload)?;
            *guard = next;
        }
        Ok(output)
    }
}

fn clear_confirmed<R: SyncRecord>(
    state: &mut CollectionState<R>,
    confirmed: &ConfirmedPush<R>,
) -> bool {
    let id = confirmed.record.id();
    let entry_matches = state.pending.get(&id) == Some(&confirmed.entry);
    let record_matches = state.records.get(&id) == Some(&confirmed.record);
    if entry_matches && record_matches {
        state.pending.remove(&id);
        true
    } else {
        false
    }
}

impl<R: ParentRecord> ParentLookup for Collection<R> {
    fn parent(&self, id: RecordId) -> Option<ParentSpec> {
        self.get(id)
            .filter(|record| record.is_active())
            .map(|record| ParentSpec {
                id,
                allowed_values: record.allowed_values().to_vec(),
            })
    }
}
