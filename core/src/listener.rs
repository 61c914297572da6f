//! Weakly held listener lists
//!
//! Listeners are stored as `Weak` references so registering never keeps an observer
//! alive. Notification works on a snapshot of the list, which lets a callback remove
//! itself (or register others) while it runs.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};

pub struct ListenerList<L: ?Sized> {
    entries: RwLock<Vec<Weak<L>>>,
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

fn same_target<L: ?Sized>(weak: &Weak<L>, strong: &Arc<L>) -> bool {
    weak.as_ptr() as *const () == Arc::as_ptr(strong) as *const ()
}

impl<L: ?Sized + Send + Sync + 'static> ListenerList<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; returns false if it was already registered
    pub fn add(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write();
        entries.retain(|w| w.strong_count() > 0);
        if entries.iter().any(|w| same_target(w, listener)) {
            return false;
        }
        entries.push(Arc::downgrade(listener));
        true
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|w| w.strong_count() > 0 && !same_target(w, listener));
        entries.len() != before
    }

    /// Live listeners at this instant
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Invoke `notify` for every live listener.
    ///
    /// Inside a tokio runtime each call runs on its own spawned task so a slow listener
    /// never stalls the caller. Outside a runtime the calls run inline.
    pub fn dispatch<F>(&self, notify: F)
    where
        F: Fn(&L) + Send + Sync + 'static,
    {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let notify = Arc::new(notify);
                for listener in listeners {
                    let notify = Arc::clone(&notify);
                    handle.spawn(async move { (*notify)(&*listener) });
                }
            }
            Err(_) => {
                for listener in listeners {
                    notify(&*listener);
                }
            }
        }
    }
}
