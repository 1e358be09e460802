//! In-flight call registry.
//!
//! When two instances sharing a cache key start a call before any cache
//! entry exists, the second one joins the first one's pending call instead
//! of invoking its own service. An entry lives only while its call is
//! pending, so only truly concurrent callers share it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::RequestError;
use crate::hook::ServiceCall;
use crate::value::AnyValue;

/// A pending call that several awaiters may drive to completion.
pub type SharedCall = Shared<BoxFuture<'static, Result<AnyValue, RequestError>>>;

struct Pending {
    owner: u64,
    token: u64,
    call: SharedCall,
}

#[derive(Default)]
struct RegistryInner {
    pending: Mutex<HashMap<String, Pending>>,
    next_token: AtomicU64,
}

/// Process-wide registry of pending calls keyed by cache key.
#[derive(Clone, Default)]
pub struct PromiseRegistry {
    inner: Arc<RegistryInner>,
}

impl PromiseRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pending call for `key`, if any.
    pub fn get(&self, key: &str) -> Option<SharedCall> {
        self.inner
            .pending
            .lock()
            .get(key)
            .map(|p| p.call.clone())
    }

    /// Installs `call` as the shared call for `key` on behalf of `owner`.
    ///
    /// The entry removes itself once the call settles, whichever awaiter
    /// happens to drive it. A later install for the same key is left alone.
    pub fn share(&self, key: &str, owner: u64, call: ServiceCall) -> SharedCall {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_owned();

        let shared = async move {
            let out = call.await;
            if let Some(inner) = weak.upgrade() {
                let mut pending = inner.pending.lock();
                if pending.get(&owned_key).is_some_and(|p| p.token == token) {
                    pending.remove(&owned_key);
                }
            }
            out
        }
        .boxed()
        .shared();

        self.inner.pending.lock().insert(
            key.to_owned(),
            Pending {
                owner,
                token,
                call: shared.clone(),
            },
        );
        shared
    }

    /// Joins another owner's pending call for `key`, or shares `call`.
    ///
    /// A pending entry installed by `owner` itself is never reused: an
    /// instance re-running while its own previous call is still pending gets
    /// a fresh call.
    pub fn dedupe(&self, key: &str, owner: u64, call: ServiceCall) -> ServiceCall {
        let existing = self
            .inner
            .pending
            .lock()
            .get(key)
            .filter(|p| p.owner != owner)
            .map(|p| p.call.clone());

        match existing {
            Some(joined) => {
                trace!(key = %key, owner, "Joining in-flight call");
                joined.boxed()
            }
            None => self.share(key, owner, call).boxed(),
        }
    }

    /// Returns the number of pending calls.
    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Returns `true` if no call is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PromiseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseRegistry")
            .field("pending", &self.len())
            .finish()
    }
}
