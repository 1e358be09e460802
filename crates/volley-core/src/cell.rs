//! Observable single-value state cells.
//!
//! Every piece of visible request state (`data`, `loading`, `error`,
//! `params`, `status`, `polling_count`) lives in a [`Cell`]. Writes notify
//! subscribers synchronously, after the value lock has been released, so a
//! subscriber may read or write any cell (including the one that fired).
//!
//! ```rust,ignore
//! let loading = Cell::new(false);
//! let sub = loading.subscribe(|v| println!("loading = {v}"));
//! loading.set(true); // prints "loading = true"
//! drop(sub);         // unsubscribes
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// Subscription
// =============================================================================

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes. Call [`detach`](Self::detach) to keep
/// the listener registered for the lifetime of its source.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription that runs `cancel` when unsubscribed.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that does nothing when dropped.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribes now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the listener registered forever.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Cell
// =============================================================================

struct CellInner<T> {
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

/// A shared, observable value.
///
/// Cloning a `Cell` yields another handle to the same value.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: RwLock::new(value),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Reads the current value without cloning it.
    pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        f(&self.inner.value.read())
    }

    /// Writes a new value and notifies subscribers.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.notify();
    }

    /// Writes a new value, returning the previous one.
    pub fn replace(&self, value: T) -> T {
        let old = std::mem::replace(&mut *self.inner.value.write(), value);
        self.notify();
        old
    }

    /// Writes `value` only if it differs; returns whether it did.
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        {
            let mut current = self.inner.value.write();
            if *current == value {
                return false;
            }
            *current = value;
        }
        self.notify();
        true
    }

    /// Mutates the value in place and notifies subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.write());
        self.notify();
    }

    /// Registers a listener called with the new value after every write.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<CellInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Registers a listener called with the new and old values whenever a
    /// write actually changes the value.
    pub fn watch(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> Subscription
    where
        T: PartialEq,
    {
        let last = Mutex::new(self.get());
        self.subscribe(move |value| {
            let old = {
                let mut last = last.lock();
                if *last == *value {
                    return;
                }
                std::mem::replace(&mut *last, value.clone())
            };
            listener(value, &old);
        })
    }

    /// Returns the number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn notify(&self) {
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.get();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cell").field(&*self.inner.value.read()).finish()
    }
}

// =============================================================================
// Observable
// =============================================================================

/// An erased "something changed" source.
///
/// Used where only the fact of a change matters, such as dependency-triggered
/// refresh.
pub trait Observable: Send + Sync {
    /// Registers `on_change`, called when the observed value changes.
    fn observe(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable for Cell<T> {
    fn observe(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.watch(move |_, _| on_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_notifies_with_new_value() {
        let cell = Cell::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = cell.subscribe(move |v| seen2.lock().push(*v));

        cell.set(2);
        cell.update(|v| *v += 1);

        assert_eq!(*seen.lock(), vec![2, 3]);
        assert_eq!(cell.get(), 3);
    }

    #[test]
    fn test_drop_subscription_unsubscribes() {
        let cell = Cell::new(0);
        let sub = cell.subscribe(|_| {});
        assert_eq!(cell.subscriber_count(), 1);
        drop(sub);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_detached_subscription_survives() {
        let cell = Cell::new(0);
        cell.subscribe(|_| {}).detach();
        assert_eq!(cell.subscriber_count(), 1);
    }

    #[test]
    fn test_listener_may_write_back() {
        let cell = Cell::new(0);
        let mirror = Cell::new(0);
        let mirror2 = mirror.clone();
        let _sub = cell.subscribe(move |v| mirror2.set(*v * 10));

        cell.set(4);
        assert_eq!(mirror.get(), 40);
    }

    #[test]
    fn test_observable_erases_value() {
        let cell = Cell::new(String::new());
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        let dep: Arc<dyn Observable> = Arc::new(cell.clone());
        let _sub = dep.observe(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        cell.set("a".into());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_skips_same_value_writes() {
        let cell = Cell::new(0u8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = cell.watch(move |new, old| seen2.lock().push((*new, *old)));

        cell.set(0);
        cell.set(1);
        cell.set(1);
        cell.update(|v| *v += 1);

        assert_eq!(*seen.lock(), vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_observable_ignores_rewrite_of_same_value() {
        let cell = Cell::new(3u8);
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        let _sub = cell.observe(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        cell.set(3);
        cell.set(3);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        cell.set(4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
