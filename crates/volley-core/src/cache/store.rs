//! The default TTL cache store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

use super::{CacheBackend, CacheEntry, Ttl};

struct Slot {
    entry: CacheEntry,
    expires_at: Option<Instant>,
    seq: u64,
    evict: Option<AbortHandle>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(evict) = self.evict.take() {
            evict.abort();
        }
    }
}

#[derive(Default)]
struct StoreInner {
    slots: Mutex<HashMap<String, Slot>>,
    seq: Mutex<u64>,
}

/// Process-wide TTL store of cached results.
///
/// Each write re-arms a per-key eviction task on the current Tokio runtime.
/// Reads also check expiry lazily, so the store stays correct when no
/// runtime is available to host the eviction task.
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes one entry, returning whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.slots.lock().remove(key).is_some()
    }

    /// Removes every listed entry.
    pub fn clear_keys<K: AsRef<str>>(&self, keys: &[K]) {
        let mut slots = self.inner.slots.lock();
        for key in keys {
            slots.remove(key.as_ref());
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.slots.lock().clear();
    }

    /// Returns `true` if a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns the number of stored entries, including expired entries that
    /// have not been evicted yet.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_seq(&self) -> u64 {
        let mut seq = self.inner.seq.lock();
        *seq += 1;
        *seq
    }

    fn spawn_eviction(
        weak: Weak<StoreInner>,
        key: String,
        seq: u64,
        at: Instant,
    ) -> Option<AbortHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let task = handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut slots = inner.slots.lock();
            if slots.get(&key).is_some_and(|slot| slot.seq == seq) {
                // The running task must not abort itself through Slot::drop.
                if let Some(mut slot) = slots.remove(&key) {
                    slot.evict = None;
                }
                trace!(key = %key, "Cache entry evicted");
            }
        });
        Some(task.abort_handle())
    }
}

impl CacheBackend for CacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.get(key)?;
        if slot.expires_at.is_some_and(|at| at <= Instant::now()) {
            slots.remove(key);
            return None;
        }
        Some(slot.entry.clone())
    }

    fn set(&self, key: &str, entry: CacheEntry, cache_time: Ttl) {
        let seq = self.next_seq();
        let (expires_at, evict) = match cache_time.duration() {
            None => (None, None),
            Some(ttl) => {
                let at = Instant::now() + ttl;
                let evict =
                    Self::spawn_eviction(Arc::downgrade(&self.inner), key.to_owned(), seq, at);
                (Some(at), evict)
            }
        };

        // Replacing the slot drops the previous one, aborting its timer.
        self.inner.slots.lock().insert(
            key.to_owned(),
            Slot {
                entry,
                expires_at,
                seq,
                evict,
            },
        );
        trace!(key = %key, ?cache_time, "Cache entry written");
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.len())
            .finish()
    }
}
