//! Environment collaborators: authentication, reachability and time.
//!
//! # Responsibility
//! - Define the narrow signals the engine consumes from the host app.
//! - Provide in-process implementations for embedding, the CLI and tests.
//!
//! # Invariants
//! - A `Subscription` runs its cancellation exactly once.
//! - Listeners are never invoked while an internal lock is held.

use log::debug;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    pub id: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Authentication state exposed by the host app.
pub trait AuthSource: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn current_user(&self) -> Option<UserIdentity>;
}

/// Callback invoked with the new reachability value.
pub type ConnectivityListener = Box<dyn Fn(bool) + Send + Sync>;

/// Network reachability exposed by the host app.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Registers `listener` for reachability transitions.
    fn on_change(&self, listener: ConnectivityListener) -> Subscription;
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Handle to a registered listener. Cancels on `cancel()` or drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the clock forward and returns the new time.
    pub fn advance(&self, by_ms: i64) -> i64 {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst) + by_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Auth state set directly by the host (or a test).
#[derive(Debug, Default)]
pub struct StaticAuth {
    authenticated: AtomicBool,
    user: RwLock<Option<UserIdentity>>,
}

impl StaticAuth {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let auth = Self::default();
        auth.sign_in(user_id);
        auth
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) =
            Some(UserIdentity::new(user_id));
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn sign_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Keeps the user but flips the authenticated flag, e.g. an expired
    /// session.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthSource for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn current_user(&self) -> Option<UserIdentity> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type SharedConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct ConnectivityInner {
    connected: AtomicBool,
    next_listener_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, SharedConnectivityListener>>,
}

/// Reachability flag flipped by the host (or a test).
///
/// Listeners fire only on transitions.
#[derive(Clone, Default)]
pub struct ManualConnectivity {
    inner: Arc<ConnectivityInner>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let connectivity = Self::default();
        connectivity.inner.connected.store(connected, Ordering::SeqCst);
        connectivity
    }

    /// Sets reachability and notifies listeners when the value changed.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.inner.connected.swap(connected, Ordering::SeqCst);
        if previous == connected {
            return;
        }
        debug!(
            "event=connectivity_change module=sync status=ok connected={}",
            connected
        );
        let listeners: Vec<SharedConnectivityListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(connected);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Connectivity for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn on_change(&self, listener: ConnectivityListener) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::from(listener));

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Connectivity, ManualConnectivity, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscription_cancels_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let _subscription = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connectivity_notifies_on_transitions_only() {
        let connectivity = ManualConnectivity::new(false);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = connectivity.on_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        connectivity.set_connected(true);
        connectivity.set_connected(true);
        connectivity.set_connected(false);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        subscription.cancel();
        assert_eq!(connectivity.listener_count(), 0);
        connectivity.set_connected(true);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
