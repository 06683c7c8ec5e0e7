//! Ordered callback registry with lazy removal
//!
//! Callbacks are invoked without holding the registry lock, so a callback can register or unregister observers,
//! including itself. Unregistering only clears the entry's active flag; entries are purged after the dispatch pass.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Mutex};

/// Observer callback
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

pub(crate) struct Observers<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Observers<T> {
    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, id: u64, callback: Callback<T>) {
        let mut entries = self.entries();
        entries.retain(|entry| entry.active.load(Acquire));
        entries.push(Entry {
            id,
            active: Arc::new(AtomicBool::new(true)),
            callback,
        });
    }

    /// Mark the observer inactive, returns false if it was not registered
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.active.swap(false, Release))
            .unwrap_or(false)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.active.load(Acquire))
            .count()
    }

    /// Call every active observer in registration order
    pub(crate) fn dispatch(&self, value: &T) {
        let snapshot: Vec<(Arc<AtomicBool>, Callback<T>)> = self
            .entries()
            .iter()
            .filter(|entry| entry.active.load(Acquire))
            .map(|entry| (entry.active.clone(), entry.callback.clone()))
            .collect();

        for (active, callback) in snapshot {
            if active.load(Acquire) {
                callback(value);
            }
        }

        self.entries().retain(|entry| entry.active.load(Acquire));
    }
}
