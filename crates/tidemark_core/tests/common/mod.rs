#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tidemark_core::sync::remote::{encode_document, ChangeListener};
use tidemark_core::{
    BlobRepository, Collection, Document, EngineConfig, ManualClock, ManualConnectivity,
    MemoryRemote, NotePatch, OwnerFilter, ParentLookup, RecordId, RemoteError, RemoteSnapshot,
    RemoteStore, SqliteBlobRepository, StaticAuth, Subscription, SyncEngine, SyncEnvironment,
    SyncRecord, Task, TaskBoard, TaskBoardPatch, TaskPatch,
};

pub const USER: &str = "user-1";
pub const OWNER_FIELD: &str = "owner_uid";
pub const START_MS: i64 = 1_700_000_000_000;

/// In-memory database plus controllable collaborators.
pub struct Harness {
    pub blobs: Arc<dyn BlobRepository>,
    pub remote: MemoryRemote,
    pub auth: Arc<StaticAuth>,
    pub connectivity: ManualConnectivity,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn new(connected: bool) -> Self {
        Self {
            blobs: Arc::new(SqliteBlobRepository::open_in_memory().unwrap()),
            remote: MemoryRemote::new(),
            auth: Arc::new(StaticAuth::signed_in(USER)),
            connectivity: ManualConnectivity::new(connected),
            clock: Arc::new(ManualClock::new(START_MS)),
        }
    }

    pub fn env(&self) -> SyncEnvironment {
        self.env_with_remote(Arc::new(self.remote.clone()))
    }

    pub fn env_with_remote(&self, remote: Arc<dyn RemoteStore>) -> SyncEnvironment {
        SyncEnvironment {
            remote,
            auth: self.auth.clone(),
            connectivity: Arc::new(self.connectivity.clone()),
            clock: self.clock.clone(),
        }
    }

    pub fn collection<R: SyncRecord>(&self) -> Arc<Collection<R>> {
        Arc::new(Collection::load(Arc::clone(&self.blobs)).unwrap())
    }

    pub fn engine<R: SyncRecord>(&self) -> SyncEngine<R> {
        SyncEngine::new(self.collection(), self.env(), EngineConfig::default())
    }

    /// Board engine plus a task engine validating against the same boards.
    pub fn board_and_task_engines(&self) -> (SyncEngine<TaskBoard>, SyncEngine<Task>) {
        let boards = self.collection::<TaskBoard>();
        let lookup: Arc<dyn ParentLookup> = boards.clone();
        let tasks = SyncEngine::new(self.collection::<Task>(), self.env(), EngineConfig::default())
            .with_parents(lookup);
        let boards = SyncEngine::new(boards, self.env(), EngineConfig::default());
        (boards, tasks)
    }

    /// Writes `record` remotely as another device owned by `owner` would.
    pub fn put_remote<R: SyncRecord>(&self, record: &R, owner: &str) {
        self.remote
            .put_document(R::COLLECTION, record.id(), document_for(record, owner));
    }

    pub fn remote_field<R: SyncRecord>(&self, id: RecordId, field: &str) -> serde_json::Value {
        self.remote
            .document(R::COLLECTION, id)
            .and_then(|document| document.get(field).cloned())
            .unwrap_or(serde_json::Value::Null)
    }
}

pub fn document_for<R: SyncRecord>(record: &R, owner: &str) -> Document {
    encode_document(
        record,
        OwnerFilter {
            field: OWNER_FIELD,
            owner,
        },
    )
    .unwrap()
}

pub fn board_patch(name: &str, status_types: &[&str]) -> TaskBoardPatch {
    TaskBoardPatch {
        name: Some(name.to_string()),
        status_types: Some(status_types.iter().map(|value| value.to_string()).collect()),
        ..TaskBoardPatch::default()
    }
}

pub fn task_patch(name: &str, completion_status: Option<&str>) -> TaskPatch {
    TaskPatch {
        name: Some(name.to_string()),
        completion_status: completion_status.map(str::to_string),
        ..TaskPatch::default()
    }
}

pub fn note_patch(title: &str, content: &str) -> NotePatch {
    NotePatch {
        title: Some(title.to_string()),
        content: Some(content.to_string()),
        ..NotePatch::default()
    }
}

/// Remote call a `GatedRemote` parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedCall {
    Query,
    Upsert,
}

/// Remote store whose first gated call parks until the test releases it.
pub struct GatedRemote {
    inner: MemoryRemote,
    call: GatedCall,
    gate: Mutex<Option<(Sender<Option<RecordId>>, Receiver<()>)>>,
}

/// Test-side handles of a `GatedRemote`. `entered` carries the id of a
/// parked upsert.
pub struct Gate {
    pub entered: Receiver<Option<RecordId>>,
    pub release: Sender<()>,
}

impl GatedRemote {
    pub fn new(inner: MemoryRemote) -> (Self, Gate) {
        Self::on(inner, GatedCall::Query)
    }

    pub fn on(inner: MemoryRemote, call: GatedCall) -> (Self, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let remote = Self {
            inner,
            call,
            gate: Mutex::new(Some((entered_tx, release_rx))),
        };
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (remote, gate)
    }

    fn park(&self, call: GatedCall, id: Option<RecordId>) {
        if call != self.call {
            return;
        }
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((entered, release)) = gate {
            entered.send(id).unwrap();
            release.recv().unwrap();
        }
    }
}

impl RemoteStore for GatedRemote {
    fn query(&self, collection: &str, filter: OwnerFilter<'_>) -> Result<RemoteSnapshot, RemoteError> {
        self.park(GatedCall::Query, None);
        self.inner.query(collection, filter)
    }

    fn upsert(&self, collection: &str, id: RecordId, document: Document) -> Result<(), RemoteError> {
        self.park(GatedCall::Upsert, Some(id));
        self.inner.upsert(collection, id, document)
    }

    fn subscribe(
        &self,
        collection: &str,
        filter: OwnerFilter<'_>,
        listener: ChangeListener,
    ) -> Result<Subscription, RemoteError> {
        self.inner.subscribe(collection, filter, listener)
    }
}
