//! Callback sets with snapshot dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Insertion-ordered set of callbacks.
///
/// [`Subscribers::emit`] iterates over a snapshot taken before the first callback runs,
/// so callbacks may subscribe or unsubscribe (themselves or others) while being
/// dispatched; changes take effect from the next emit.
pub struct Subscribers<T: ?Sized> {
    inner: Mutex<Entries<T>>,
}

struct Entries<T: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

impl<T: ?Sized + 'static> Subscribers<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Entries { next_id: 0, callbacks: Vec::new() }) })
    }

    /// Register `callback`; the returned [`Subscription`] removes it again.
    pub fn add(self: &Arc<Self>, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let callback: Callback<T> = Arc::new(callback);
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.callbacks.push((id, callback));
            id
        };

        let set: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || set.upgrade().is_some_and(|set| set.remove(id)))
    }

    fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|(entry, _)| *entry != id);
        inner.callbacks.len() != before
    }

    /// Invoke every callback registered at the time of the call, in registration order.
    ///
    /// A panicking callback is logged and skipped; the remaining ones still run.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self.inner.lock().callbacks.iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!("Subscriber callback panicked");
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by the controller's `on_*` methods.
///
/// Dropping it keeps the callback registered; call [`Subscription::unsubscribe`].
pub struct Subscription {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl Subscription {
    fn new(remove: impl FnOnce() -> bool + Send + Sync + 'static) -> Self {
        Self { remove: Box::new(remove) }
    }

    /// Remove the callback. Returns `false` if it was already gone (e.g. after a reset).
    pub fn unsubscribe(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
