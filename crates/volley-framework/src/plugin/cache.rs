//! Shared result caching with stale-while-revalidate.
//!
//! A fresh entry short-circuits the call. A stale one is surfaced as `data`
//! immediately while the call proceeds. Concurrent calls for one key from
//! different instances share a single service invocation, and every write
//! is broadcast so instances with the same static key stay in sync.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};
use volley_core::{
    AnyValue, BeforeOutcome, BoxError, CacheBackend, CacheBus, CacheEntry, CacheKey, CacheStore,
    DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME, HookMap, PluginContext, PluginFactory, PromiseRegistry,
    RequestHandle, RequestHooks, ServiceCall, Ttl,
};

use super::CACHE;

#[derive(Debug, Clone, Copy, Default)]
pub struct CachePlugin;

struct CacheHooks {
    handle: RequestHandle,
    key: CacheKey,
    backend: Arc<dyn CacheBackend>,
    promises: Option<Arc<PromiseRegistry>>,
    bus: Option<Arc<CacheBus>>,
    cache_time: Ttl,
    stale_time: Ttl,
}

impl CacheHooks {
    fn write(&self, key: &str, data: &AnyValue, params: Option<AnyValue>) {
        self.backend
            .set(key, CacheEntry::new(Arc::clone(data), params), self.cache_time);
        if let Some(bus) = &self.bus {
            bus.trigger(key, data);
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        !self.stale_time.has_elapsed(entry.timestamp, Instant::now())
    }
}

impl RequestHooks for CacheHooks {
    fn on_before(&self, params: &AnyValue) -> BeforeOutcome {
        let key = self.key.resolve(Some(params));
        let Some(entry) = self.backend.get(&key) else {
            return BeforeOutcome::proceed();
        };
        if self.is_fresh(&entry) {
            trace!(request = self.handle.id(), key = %key, "Cache hit");
            BeforeOutcome::short_circuit(Some(entry.data))
        } else {
            trace!(request = self.handle.id(), key = %key, "Serving stale entry");
            BeforeOutcome::with_data(entry.data)
        }
    }

    fn on_init(&self, params: &AnyValue, call: ServiceCall) -> ServiceCall {
        match &self.promises {
            Some(promises) => {
                let key = self.key.resolve(Some(params));
                promises.dedupe(&key, self.handle.id(), call)
            }
            None => call,
        }
    }

    fn on_success(&self, data: &AnyValue, params: &AnyValue) {
        let key = self.key.resolve(Some(params));
        self.write(&key, data, Some(Arc::clone(params)));
    }

    fn on_mutate(&self, data: &AnyValue) {
        let params = self.handle.params();
        let key = self.key.resolve(params.as_ref());
        self.write(&key, data, params);
    }
}

impl PluginFactory for CachePlugin {
    fn name(&self) -> &str {
        CACHE
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        let Some(key) = options.cache_key.clone() else {
            return Ok(Box::new(HookMap::new()));
        };
        let handle = ctx.handle().clone();

        let backend: Arc<dyn CacheBackend> = match (&options.cache_store, ctx.service::<CacheStore>()) {
            (Some(custom), _) => Arc::clone(custom),
            (None, Some(shared)) => shared as Arc<dyn CacheBackend>,
            (None, None) => {
                debug!(request = handle.id(), "No shared cache store; caching per instance");
                Arc::new(CacheStore::new())
            }
        };
        let hooks = CacheHooks {
            handle: handle.clone(),
            key,
            backend,
            promises: ctx.service::<PromiseRegistry>(),
            bus: ctx.service::<CacheBus>(),
            cache_time: options.cache_time.unwrap_or(DEFAULT_CACHE_TIME),
            stale_time: options.stale_time.unwrap_or(DEFAULT_STALE_TIME),
        };

        if let Some(key) = hooks.key.as_static() {
            // Adopt what an earlier instance left behind.
            if let Some(entry) = hooks.backend.get(key) {
                handle.set_data(Some(entry.data));
                if let (Some(params), Some(core)) = (entry.params, handle.upgrade()) {
                    core.state().params.set(Some(params));
                }
            }

            if let Some(bus) = &hooks.bus {
                let target = handle.clone();
                let sub = bus.subscribe(key, move |data: &AnyValue| {
                    let same = target.data().is_some_and(|current| Arc::ptr_eq(&current, data));
                    if !same {
                        target.set_data(Some(Arc::clone(data)));
                    }
                });
                handle.on_dispose(move || drop(sub));
            }
        }

        Ok(Box::new(hooks))
    }
}
