//! Cache subsystem shared by every request instance.
//!
//! Three independent services live here:
//!
//! - [`CacheStore`]: a TTL key-value store of the last accepted result per
//!   cache key, with a per-entry eviction timer.
//! - [`PromiseRegistry`]: the in-flight call registry letting concurrent
//!   same-key callers share one underlying service call.
//! - [`CacheBus`]: a publish/subscribe channel keyed by cache key, through
//!   which instances sharing a key converge on each other's writes.
//!
//! None of them is a hidden static. The runtime owns one of each and hands
//! them to the cache plugin; tests construct fresh ones.

mod bus;
mod promise;
mod store;

use std::time::Duration;

use tokio::time::Instant;

use crate::value::AnyValue;

pub use bus::CacheBus;
pub use promise::{PromiseRegistry, SharedCall};
pub use store::CacheStore;

/// Default lifetime of a cache entry.
pub const DEFAULT_CACHE_TIME: Ttl = Ttl::For(Duration::from_secs(5 * 60));

/// Default freshness window: every hit revalidates.
pub const DEFAULT_STALE_TIME: Ttl = Ttl::For(Duration::ZERO);

/// A time-to-live that may be infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// Never expires.
    Forever,
    /// Expires after the given duration.
    For(Duration),
}

impl Ttl {
    /// Converts a millisecond count where any negative value means forever.
    pub fn from_millis(ms: i64) -> Self {
        u64::try_from(ms).map_or(Self::Forever, |ms| Self::For(Duration::from_millis(ms)))
    }

    /// Returns the finite duration, if any.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Forever => None,
            Self::For(d) => Some(d),
        }
    }

    /// Returns `true` if `since + self` lies in the past at `now`.
    pub fn has_elapsed(self, since: Instant, now: Instant) -> bool {
        match self {
            Self::Forever => false,
            Self::For(d) => now.saturating_duration_since(since) > d,
        }
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Self::For(d)
    }
}

/// One cached result.
#[derive(Clone)]
pub struct CacheEntry {
    /// The cached value.
    pub data: AnyValue,
    /// Params of the call that produced the value.
    pub params: Option<AnyValue>,
    /// When the value was written.
    pub timestamp: Instant,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(data: AnyValue, params: Option<AnyValue>) -> Self {
        Self {
            data,
            params,
            timestamp: Instant::now(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// A pluggable cache backend.
///
/// [`CacheStore`] is the built-in implementation. A caller-supplied backend
/// replaces it for one request without changing any call site; such a
/// backend may ignore `cache_time` and manage expiry itself.
pub trait CacheBackend: Send + Sync {
    /// Looks up a live entry.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Writes an entry, replacing any previous one.
    fn set(&self, key: &str, entry: CacheEntry, cache_time: Ttl);
}
