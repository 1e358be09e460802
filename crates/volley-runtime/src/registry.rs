//! Request-id map for external lookup.
//!
//! Instances built with an `id` option are registered here so unrelated
//! code can reach them by name. Disposing the instance removes its entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use volley_core::RequestCore;

/// Shared map of string id to request instance.
#[derive(Clone, Default)]
pub struct RequestMap {
    requests: Arc<RwLock<HashMap<String, RequestCore>>>,
}

impl RequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `core` under `id`, replacing any previous holder.
    pub fn insert(&self, id: impl Into<String>, core: RequestCore) {
        let id = id.into();
        let mut requests = self.requests.write();
        if let Some(previous) = requests.get(&id) {
            warn!(
                id = %id,
                previous = previous.id(),
                replacement = core.id(),
                "Request id already registered, overwriting"
            );
        }
        debug!(id = %id, request = core.id(), "Registered request");
        requests.insert(id, core);
    }

    pub fn get(&self, id: &str) -> Option<RequestCore> {
        self.requests.read().get(id).cloned()
    }

    /// Removes `id`, returning whether it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.requests.write().remove(id).is_some()
    }

    /// Removes `id` only if it still maps to the instance numbered `request`.
    pub(crate) fn remove_if(&self, id: &str, request: u64) -> bool {
        let mut requests = self.requests.write();
        match requests.get(id) {
            Some(core) if core.id() == request => requests.remove(id).is_some(),
            _ => false,
        }
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.requests.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }
}

impl std::fmt::Debug for RequestMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMap")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tower::service_fn;
    use tower::util::BoxCloneSyncService;
    use volley_core::{AnyValue, BoxError, RequestOptions};

    use super::*;

    fn core() -> RequestCore {
        let service = BoxCloneSyncService::new(service_fn(|p: AnyValue| async move {
            Ok::<_, BoxError>(p)
        }));
        RequestCore::new(service, RequestOptions::new())
    }

    #[test]
    fn test_insert_overwrites() {
        let map = RequestMap::new();
        let first = core();
        let second = core();

        map.insert("user", first.clone());
        map.insert("user", second.clone());

        assert_eq!(map.len(), 1);
        assert_eq!(map.get("user").map(|c| c.id()), Some(second.id()));
        assert!(!map.remove_if("user", first.id()));
        assert!(map.remove_if("user", second.id()));
        assert!(map.is_empty());
    }

    #[test]
    fn test_ids_and_remove() {
        let map = RequestMap::new();
        map.insert("b", core());
        map.insert("a", core());

        assert_eq!(map.ids(), vec!["a".to_owned(), "b".to_owned()]);
        assert!(map.remove("a"));
        assert!(!map.remove("a"));
        assert!(map.get("a").is_none());
    }
}
