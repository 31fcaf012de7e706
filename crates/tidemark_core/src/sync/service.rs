//! Background trigger for one collection engine.
//!
//! # Responsibility
//! - Turn reachability transitions and remote change notifications into
//!   reconciliation requests.
//! - Run pushes and reconciliations on a dedicated worker thread so the
//!   mutation surface never waits on the network.
//!
//! # Invariants
//! - At most one reconciliation request is queued or running at a time;
//!   further requests collapse into it.
//! - At most one remote subscription is live, scoped to the current user.
//! - Dropping the service cancels every subscription and joins the worker.

use crate::model::record::{RecordId, SyncRecord};
use crate::sync::engine::{MutationError, SyncEngine};
use crate::sync::env::Subscription;
use crate::sync::remote::RemoteError;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;

/// What asked for a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Reconnected,
    RemoteChange,
    Explicit,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reconnected => "reconnected",
            Self::RemoteChange => "remote_change",
            Self::Explicit => "explicit",
        }
    }
}

enum Job {
    Push(RecordId),
    Reconcile(TriggerReason),
    Barrier(Sender<()>),
    Shutdown,
}

struct Dispatcher {
    jobs: Mutex<Sender<Job>>,
    reconcile_slot: AtomicBool,
}

impl Dispatcher {
    fn send(&self, job: Job) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .is_ok()
    }

    /// Claims the single reconcile slot. Returns false when collapsed.
    fn request_reconcile(&self, collection: &str, reason: TriggerReason) -> bool {
        if self.reconcile_slot.swap(true, Ordering::SeqCst) {
            debug!(
                "event=reconcile_request module=sync status=skip collection={} reason={} cause=collapsed",
                collection,
                reason.as_str()
            );
            return false;
        }
        if !self.send(Job::Reconcile(reason)) {
            self.reconcile_slot.store(false, Ordering::SeqCst);
            return false;
        }
        debug!(
            "event=reconcile_request module=sync status=ok collection={} reason={}",
            collection,
            reason.as_str()
        );
        true
    }
}

struct UserSubscription {
    user_id: String,
    _subscription: Subscription,
}

/// Owns the worker thread and subscriptions driving one `SyncEngine`.
pub struct SyncService<R: SyncRecord> {
    engine: Arc<SyncEngine<R>>,
    dispatcher: Arc<Dispatcher>,
    connectivity_subscription: Option<Subscription>,
    remote_subscription: Mutex<Option<UserSubscription>>,
    worker: Option<JoinHandle<()>>,
}

impl<R: SyncRecord> SyncService<R> {
    /// Spawns the worker, listens for reachability changes and subscribes
    /// to remote changes for the current user, if any.
    ///
    /// # Errors
    /// - Returns an error when the worker thread cannot be spawned.
    pub fn start(engine: Arc<SyncEngine<R>>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let dispatcher = Arc::new(Dispatcher {
            jobs: Mutex::new(sender),
            reconcile_slot: AtomicBool::new(false),
        });

        let worker_engine = Arc::clone(&engine);
        let worker_dispatcher = Arc::clone(&dispatcher);
        let worker = std::thread::Builder::new()
            .name(format!("tidemark-sync-{}", R::COLLECTION))
            .spawn(move || run_worker(worker_engine, worker_dispatcher, receiver))?;

        let listener_dispatcher = Arc::clone(&dispatcher);
        let connectivity_subscription =
            engine
                .env()
                .connectivity
                .on_change(Box::new(move |connected| {
                    if connected {
                        listener_dispatcher
                            .request_reconcile(R::COLLECTION, TriggerReason::Reconnected);
                    }
                }));

        let service = Self {
            engine,
            dispatcher,
            connectivity_subscription: Some(connectivity_subscription),
            remote_subscription: Mutex::new(None),
            worker: Some(worker),
        };
        if let Err(err) = service.refresh_user() {
            warn!(
                "event=remote_subscribe module=sync status=error collection={} error={}",
                R::COLLECTION,
                err
            );
        }
        info!(
            "event=sync_service_start module=sync status=ok collection={}",
            R::COLLECTION
        );
        Ok(service)
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    /// Applies a save locally and queues its push.
    pub fn save(&self, parent_id: Option<RecordId>, patch: R::Patch) -> Result<R, MutationError> {
        let record = self.engine.save_local(parent_id, patch)?;
        self.dispatcher.send(Job::Push(record.id()));
        Ok(record)
    }

    /// Applies a soft delete locally and queues its push.
    pub fn delete(&self, id: RecordId) -> Result<Option<R>, MutationError> {
        let deleted = self.engine.delete_local(id)?;
        if deleted.is_some() {
            self.dispatcher.send(Job::Push(id));
        }
        Ok(deleted)
    }

    /// Queues a reconciliation unless one is already queued or running.
    pub fn request_reconcile(&self) -> bool {
        self.dispatcher
            .request_reconcile(R::COLLECTION, TriggerReason::Explicit)
    }

    /// Re-reads the auth collaborator and moves the remote subscription to
    /// the current user. Returns whether the subscription changed.
    ///
    /// # Errors
    /// - Returns the remote error when subscribing for the new user fails;
    ///   the previous subscription is already cancelled at that point.
    pub fn refresh_user(&self) -> Result<bool, RemoteError> {
        let env = self.engine.env();
        let user = if env.auth.is_authenticated() {
            env.auth.current_user()
        } else {
            None
        };

        let mut slot = self
            .remote_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = slot.as_ref().map(|active| active.user_id.as_str());
        if current == user.as_ref().map(|user| user.id.as_str()) {
            return Ok(false);
        }

        if let Some(previous) = slot.take() {
            drop(previous);
            info!(
                "event=remote_unsubscribe module=sync status=ok collection={}",
                R::COLLECTION
            );
        }
        let Some(user) = user else {
            return Ok(true);
        };

        let subscription = env.remote.subscribe(
            R::COLLECTION,
            self.engine.owner_filter(&user),
            notification_listener(Arc::downgrade(&self.engine), Arc::clone(&self.dispatcher)),
        )?;
        *slot = Some(UserSubscription {
            user_id: user.id,
            _subscription: subscription,
        });
        info!(
            "event=remote_subscribe module=sync status=ok collection={}",
            R::COLLECTION
        );
        Ok(true)
    }

    /// Blocks until every job queued before this call has run. Returns
    /// false when the worker is gone.
    pub fn flush(&self) -> bool {
        let (ack, done) = mpsc::channel();
        self.dispatcher.send(Job::Barrier(ack)) && done.recv().is_ok()
    }
}

impl<R: SyncRecord> Drop for SyncService<R> {
    fn drop(&mut self) {
        self.connectivity_subscription.take();
        self.remote_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.dispatcher.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(
                    "event=sync_service_stop module=sync status=error collection={} cause=worker_panicked",
                    R::COLLECTION
                );
                return;
            }
        }
        info!(
            "event=sync_service_stop module=sync status=ok collection={}",
            R::COLLECTION
        );
    }
}

fn notification_listener<R: SyncRecord>(
    engine: Weak<SyncEngine<R>>,
    dispatcher: Arc<Dispatcher>,
) -> Box<dyn Fn() + Send + Sync> {
    Box::new(move || {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let elapsed = engine.env().clock.now_ms() - engine.last_sync_at();
        if engine.config().throttles(elapsed) {
            debug!(
                "event=reconcile_request module=sync status=skip collection={} reason={} cause=throttled elapsed_ms={}",
                R::COLLECTION,
                TriggerReason::RemoteChange.as_str(),
                elapsed
            );
            return;
        }
        dispatcher.request_reconcile(R::COLLECTION, TriggerReason::RemoteChange);
    })
}

fn run_worker<R: SyncRecord>(
    engine: Arc<SyncEngine<R>>,
    dispatcher: Arc<Dispatcher>,
    jobs: Receiver<Job>,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Push(id) => {
                engine.push(id);
            }
            Job::Reconcile(reason) => {
                if let Err(err) = engine.reconcile() {
                    error!(
                        "event=reconcile module=sync status=error collection={} reason={} error={}",
                        R::COLLECTION,
                        reason.as_str(),
                        err
                    );
                }
                // Released after the run so triggers raised by the run itself
                // are dropped.
                dispatcher.reconcile_slot.store(false, Ordering::SeqCst);
            }
            Job::Barrier(ack) => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
    }
}
