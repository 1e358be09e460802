//! Cross-instance cache subscription bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::Subscription;
use crate::value::AnyValue;

type Listener = Arc<dyn Fn(&AnyValue) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

/// Publish/subscribe channel keyed by cache key.
///
/// Every cache write is published here; every instance subscribed to that
/// key applies the value to its own `data`.
#[derive(Clone, Default)]
pub struct CacheBus {
    inner: Arc<BusInner>,
}

impl CacheBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listens for writes to `key`.
    pub fn subscribe(
        &self,
        key: &str,
        listener: impl Fn(&AnyValue) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));

        let weak = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut listeners = inner.listeners.lock();
            if let Some(list) = listeners.get_mut(&key) {
                list.retain(|(lid, _)| *lid != id);
                if list.is_empty() {
                    listeners.remove(&key);
                }
            }
        })
    }

    /// Publishes `data` to every listener of `key`.
    pub fn trigger(&self, key: &str, data: &AnyValue) {
        let listeners: Vec<Listener> = match self.inner.listeners.lock().get(key) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(data);
        }
    }

    /// Returns the number of listeners on `key`.
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for CacheBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBus")
            .field("keys", &self.inner.listeners.lock().len())
            .finish()
    }
}
