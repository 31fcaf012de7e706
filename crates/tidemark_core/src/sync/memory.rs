//! In-process `RemoteStore`.
//!
//! Keeps documents per collection in memory, notifies subscribers after
//! every write and lets callers inject read/write failures.

use crate::model::record::RecordId;
use crate::sync::env::Subscription;
use crate::sync::remote::{
    ChangeListener, Document, OwnerFilter, RemoteError, RemoteSnapshot, RemoteStore,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

struct RemoteListener {
    collection: String,
    owner_field: String,
    owner: String,
    callback: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct MemoryRemoteInner {
    collections: Mutex<BTreeMap<String, RemoteSnapshot>>,
    listeners: Mutex<BTreeMap<u64, RemoteListener>>,
    next_listener_id: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    rejected_ids: Mutex<BTreeSet<RecordId>>,
    query_count: AtomicUsize,
    write_count: AtomicUsize,
}

/// Remote store held entirely in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<MemoryRemoteInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `query` fail with `RemoteError::Network`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every `upsert` fail with `RemoteError::Network`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes `upsert` at `id` fail with `RemoteError::Permission`.
    pub fn reject_writes_for(&self, id: RecordId) {
        self.inner
            .rejected_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn clear_rejections(&self) {
        self.inner
            .rejected_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the document at `id`, whoever owns it.
    pub fn document(&self, collection: &str, id: RecordId) -> Option<Document> {
        self.collections()
            .get(collection)
            .and_then(|documents| documents.get(&id))
            .cloned()
    }

    /// Returns every document of `collection`, whoever owns it.
    pub fn documents(&self, collection: &str) -> RemoteSnapshot {
        self.collections()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes as another device would: bypasses failure injection and the
    /// write counter, but still notifies subscribers.
    pub fn put_document(&self, collection: &str, id: RecordId, document: Document) {
        self.store(collection, id, document);
    }

    pub fn query_count(&self) -> usize {
        self.inner.query_count.load(Ordering::SeqCst)
    }

    /// Number of accepted `upsert` calls.
    pub fn write_count(&self) -> usize {
        self.inner.write_count.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions across all collections.
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Live subscriptions for `collection` owned by `owner`.
    pub fn listener_count_for(&self, collection: &str, owner: &str) -> usize {
        self.listeners()
            .values()
            .filter(|listener| listener.collection == collection && listener.owner == owner)
            .count()
    }

    fn store(&self, collection: &str, id: RecordId, document: Document) {
        let callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .listeners()
            .values()
            .filter(|listener| {
                listener.collection == collection
                    && OwnerFilter {
                        field: &listener.owner_field,
                        owner: &listener.owner,
                    }
                    .matches(&document)
            })
            .map(|listener| Arc::clone(&listener.callback))
            .collect();

        self.collections()
            .entry(collection.to_string())
            .or_default()
            .insert(id, document);

        for callback in callbacks {
            callback();
        }
    }

    fn collections(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RemoteSnapshot>> {
        self.inner
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, RemoteListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteStore for MemoryRemote {
    fn query(&self, collection: &str, filter: OwnerFilter<'_>) -> Result<RemoteSnapshot, RemoteError> {
        self.inner.query_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("injected read failure".to_string()));
        }
        Ok(self
            .documents(collection)
            .into_iter()
            .filter(|(_, document)| filter.matches(document))
            .collect())
    }

    fn upsert(&self, collection: &str, id: RecordId, document: Document) -> Result<(), RemoteError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("injected write failure".to_string()));
        }
        let rejected = self
            .inner
            .rejected_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id);
        if rejected {
            return Err(RemoteError::Permission(format!("write to {id} rejected")));
        }
        self.inner.write_count.fetch_add(1, Ordering::SeqCst);
        self.store(collection, id, document);
        Ok(())
    }

    fn subscribe(
        &self,
        collection: &str,
        filter: OwnerFilter<'_>,
        listener: ChangeListener,
    ) -> Result<Subscription, RemoteError> {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners().insert(
            id,
            RemoteListener {
                collection: collection.to_string(),
                owner_field: filter.field.to_string(),
                owner: filter.owner.to_string(),
                callback: Arc::from(listener),
            },
        );

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRemote;
    use crate::model::record::new_record_id;
    use crate::sync::remote::{OwnerFilter, RemoteError, RemoteStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn filter(owner: &str) -> OwnerFilter<'_> {
        OwnerFilter {
            field: "owner_uid",
            owner,
        }
    }

    fn doc(owner: &str) -> serde_json::Map<String, serde_json::Value> {
        json!({"owner_uid": owner}).as_object().unwrap().clone()
    }

    #[test]
    fn query_only_returns_owned_documents() {
        let remote = MemoryRemote::new();
        let mine = new_record_id();
        remote.put_document("notes", mine, doc("alice"));
        remote.put_document("notes", new_record_id(), doc("bob"));

        let snapshot = remote.query("notes", filter("alice")).unwrap();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![mine]);
    }

    #[test]
    fn subscribers_hear_owned_writes_until_cancelled() {
        let remote = MemoryRemote::new();
        let heard = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&heard);
        let subscription = remote
            .subscribe(
                "notes",
                filter("alice"),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        remote.upsert("notes", new_record_id(), doc("alice")).unwrap();
        remote.upsert("notes", new_record_id(), doc("bob")).unwrap();
        remote.upsert("tasks", new_record_id(), doc("alice")).unwrap();
        assert_eq!(heard.load(Ordering::SeqCst), 1);

        drop(subscription);
        assert_eq!(remote.listener_count(), 0);
        remote.upsert("notes", new_record_id(), doc("alice")).unwrap();
        assert_eq!(heard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let remote = MemoryRemote::new();
        remote.set_fail_reads(true);
        assert!(matches!(
            remote.query("notes", filter("alice")),
            Err(RemoteError::Network(_))
        ));

        let id = new_record_id();
        remote.reject_writes_for(id);
        assert!(matches!(
            remote.upsert("notes", id, doc("alice")),
            Err(RemoteError::Permission(_))
        ));
        assert_eq!(remote.write_count(), 0);
    }
}
