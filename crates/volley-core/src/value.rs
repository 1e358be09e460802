//! Type-erased values crossing the plugin boundary.
//!
//! Plugins, the cache subsystem and middleware are shared by every request
//! instance regardless of its result and params types, so they see data and
//! params as [`AnyValue`]. The typed [`Request`](crate::Request) facade
//! erases on the way in and downcasts on the way out.

use std::any::Any;
use std::sync::Arc;

/// A shared, type-erased value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Erases a concrete value.
pub fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// Clones the concrete value out of an erased one, if the type matches.
pub fn downcast<T: Clone + 'static>(value: &AnyValue) -> Option<T> {
    value.downcast_ref::<T>().cloned()
}
