//! The process-wide owner of shared request services.
//!
//! A [`VolleyRuntime`] holds everything that outlives a single request
//! instance: the plugin registry, the cache store, the in-flight call
//! registry, the cache bus, the visibility bus, the request-id map and the
//! ambient options. It is also the instance factory.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use volley_runtime::VolleyRuntime;
//! use volley_core::{BoxError, Options, Ttl};
//!
//! async fn fetch_user(id: u64) -> Result<String, BoxError> {
//!     Ok(format!("user-{id}"))
//! }
//!
//! let runtime = VolleyRuntime::global();
//! let user = runtime.use_request(
//!     fetch_user,
//!     Options::new().default_params(1).cache_key("user").stale_time(Ttl::Forever),
//!     &[],
//! )?;
//! ```
//!
//! `VolleyRuntime::new()` builds a fresh, isolated set of services, which is
//! what tests want.

use std::future::Future;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::{debug, info};
use volley_core::{
    BoxError, BuildFn, CacheBus, CacheStore, ErasedService, Options, PluginFactory,
    PluginRegistry, PromiseRegistry, Request, RequestCore, RequestOptions, Services, compose,
    erase_service,
};
use volley_framework::{BASE_PRIORITIES, VisibilityBus, base_plugins};

use crate::config::VolleyConfig;
use crate::error::RuntimeResult;
use crate::logging;
use crate::registry::RequestMap;
use crate::scope::RequestScope;

static GLOBAL: LazyLock<VolleyRuntime> = LazyLock::new(VolleyRuntime::new);

struct RuntimeInner {
    plugins: PluginRegistry,
    cache: CacheStore,
    promises: PromiseRegistry,
    bus: CacheBus,
    visibility: VisibilityBus,
    requests: RequestMap,
    ambient: RwLock<RequestOptions>,
    /// Handed to every plugin factory.
    services: Services,
}

/// Owner of the shared request services and the instance factory.
///
/// Cheap to clone; clones share every service.
#[derive(Clone)]
pub struct VolleyRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for VolleyRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl VolleyRuntime {
    /// Creates a runtime with fresh services and the built-in plugins.
    pub fn new() -> Self {
        let plugins = PluginRegistry::new();
        plugins.set_base(base_plugins(), BASE_PRIORITIES);

        let cache = CacheStore::new();
        let promises = PromiseRegistry::new();
        let bus = CacheBus::new();
        let visibility = VisibilityBus::new();

        let services = Services::new()
            .with(cache.clone())
            .with(promises.clone())
            .with(bus.clone())
            .with(visibility.clone());

        Self {
            inner: Arc::new(RuntimeInner {
                plugins,
                cache,
                promises,
                bus,
                visibility,
                requests: RequestMap::new(),
                ambient: RwLock::new(RequestOptions::new()),
                services,
            }),
        }
    }

    /// The process-wide runtime.
    pub fn global() -> &'static VolleyRuntime {
        &GLOBAL
    }

    /// Creates a runtime, initializes logging and installs the configured
    /// request defaults as ambient options.
    pub fn from_config(config: &VolleyConfig) -> Self {
        logging::init_from_config(&config.logging);

        let runtime = Self::new();
        runtime.configure(config.defaults.to_options());

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            "Runtime initialized from configuration"
        );
        runtime
    }

    // -------------------------------------------------------------------------
    // Ambient configuration
    // -------------------------------------------------------------------------

    /// Merges `options` over the ambient options.
    pub fn configure(&self, options: RequestOptions) {
        let mut ambient = self.inner.ambient.write();
        *ambient = RequestOptions::merge(&ambient, &options);
    }

    /// Snapshot of the ambient options.
    pub fn global_config(&self) -> RequestOptions {
        self.inner.ambient.read().clone()
    }

    /// Registers global plugins and overrides their priorities.
    pub fn define_plugins<N: Into<String>>(
        &self,
        plugins: Vec<Arc<dyn PluginFactory>>,
        priorities: impl IntoIterator<Item = (N, i32)>,
    ) {
        self.inner.plugins.define(plugins, priorities);
    }

    // -------------------------------------------------------------------------
    // Instance factory
    // -------------------------------------------------------------------------

    /// Creates a typed request instance.
    ///
    /// `options` are merged over the ambient options, middleware is composed
    /// around construction, and the instance runs with its default params
    /// unless `manual` is set. A plugin factory error aborts construction.
    pub fn use_request<R, P, S, F>(
        &self,
        service: S,
        options: Options<R, P>,
        plugins: &[Arc<dyn PluginFactory>],
    ) -> RuntimeResult<Request<R, P>>
    where
        S: Fn(P) -> F + Send + Sync + 'static,
        F: Future<Output = Result<R, BoxError>> + Send + 'static,
        R: Clone + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        let core = self.use_request_raw(erase_service(service), options.into_raw(), plugins)?;
        Ok(Request::from_core(core))
    }

    /// Erased form of [`use_request`](Self::use_request).
    pub fn use_request_raw(
        &self,
        service: ErasedService,
        options: RequestOptions,
        plugins: &[Arc<dyn PluginFactory>],
    ) -> RuntimeResult<RequestCore> {
        let options = RequestOptions::merge(&self.global_config(), &options);
        self.build(service, options, plugins)
    }

    /// Builds from fully merged options.
    pub(crate) fn build(
        &self,
        service: ErasedService,
        options: RequestOptions,
        plugins: &[Arc<dyn PluginFactory>],
    ) -> RuntimeResult<RequestCore> {
        let build = compose(&options.middleware, self.base_build());
        let core = build(service, options, plugins.to_vec())?;

        self.bind(&core);
        if !core.options().is_manual() {
            core.run(None);
        }
        Ok(core)
    }

    /// Innermost construction step: resolve plugins, then build the core.
    fn base_build(&self) -> BuildFn {
        let runtime = self.clone();
        Arc::new(
            move |service: ErasedService,
                  options: RequestOptions,
                  per_call: Vec<Arc<dyn PluginFactory>>| {
                let plugins = runtime.inner.plugins.resolve(&per_call);
                RequestCore::with_plugins(service, options, &plugins, &runtime.inner.services)
            },
        )
    }

    /// Registers the instance id and deregisters it on dispose.
    fn bind(&self, core: &RequestCore) {
        let Some(id) = core.options().id.clone() else {
            return;
        };
        self.inner.requests.insert(id.clone(), core.clone());

        let requests = self.inner.requests.clone();
        let request = core.id();
        core.on_dispose(move || {
            if requests.remove_if(&id, request) {
                debug!(id = %id, request, "Request deregistered");
            }
        });
    }

    /// Opens a host lifecycle scope on this runtime.
    pub fn scope(&self) -> RequestScope {
        RequestScope::new(self.clone())
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Looks up a registered instance as a typed request.
    ///
    /// The types are not checked; reads through a mistyped handle come back
    /// empty.
    pub fn get_request<R, P>(&self, id: &str) -> Option<Request<R, P>>
    where
        R: Clone + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        self.get_core(id).map(Request::from_core)
    }

    pub fn get_core(&self, id: &str) -> Option<RequestCore> {
        self.inner.requests.get(id)
    }

    /// Drops the id registration without disposing the instance.
    pub fn remove_request(&self, id: &str) -> bool {
        self.inner.requests.remove(id)
    }

    // -------------------------------------------------------------------------
    // Cache control
    // -------------------------------------------------------------------------

    pub fn clear_cache<K: AsRef<str>>(&self, keys: &[K]) {
        self.inner.cache.clear_keys(keys);
        debug!(keys = keys.len(), "Cache entries cleared");
    }

    pub fn clear_all_cache(&self) {
        self.inner.cache.clear();
        debug!("Cache cleared");
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn cache_store(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn promises(&self) -> &PromiseRegistry {
        &self.inner.promises
    }

    pub fn bus(&self) -> &CacheBus {
        &self.inner.bus
    }

    /// Host hook: drive this with window focus and blur.
    pub fn visibility(&self) -> &VisibilityBus {
        &self.inner.visibility
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.inner.plugins
    }

    pub fn requests(&self) -> &RequestMap {
        &self.inner.requests
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }
}

impl std::fmt::Debug for VolleyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolleyRuntime")
            .field("plugins", &self.inner.plugins)
            .field("cached", &self.inner.cache.len())
            .field("requests", &self.inner.requests)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::TryFutureExt;
    use parking_lot::Mutex;
    use tokio::time::sleep;
    use tokio_test::{assert_pending, assert_ready};
    use tower::ServiceExt;
    use tower::service_fn;
    use tower::util::BoxCloneSyncService;
    use volley_core::{
        AnyValue, BeforeOutcome, HookMap, Middleware, RetryCount, Status, Ttl, middleware_fn,
        plugin_fn,
    };

    use super::*;
    use crate::config::RequestDefaults;

    fn delayed_echo(
        delay: Duration,
        scale: u32,
    ) -> (
        impl Fn(u32) -> futures::future::BoxFuture<'static, Result<u32, BoxError>> + Send + Sync + 'static,
        Arc<AtomicUsize>,
    ) {
        use futures::FutureExt;

        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);
        let service = move |p: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(delay).await;
                Ok::<_, BoxError>(p * scale)
            }
            .boxed()
        };
        (service, counter)
    }

    fn manual() -> Options<u32, u32> {
        Options::new().manual(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_transitions() {
        let runtime = VolleyRuntime::new();
        let (service, _) = delayed_echo(Duration::from_secs(1), 1);
        let request = runtime.use_request(service, manual(), &[]).unwrap();

        let loading = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&loading);
        let _sub = request.watch_loading(move |v| seen.lock().push(v));

        let out = request.run_async(1).await.unwrap();
        assert_eq!(out, Some(1));
        assert_eq!(request.data(), Some(1));
        assert_eq!(request.status(), Status::Settled);
        assert_eq!(*loading.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_run_with_default_params() {
        let runtime = VolleyRuntime::new();
        let (service, counter) = delayed_echo(Duration::from_millis(10), 1);
        let request = runtime
            .use_request(service, Options::new().default_params(3), &[])
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(request.data(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_run_without_params() {
        let runtime = VolleyRuntime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<u32, BoxError>(1) }
        };
        let request = runtime
            .use_request(service, Options::<u32, ()>::new(), &[])
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(request.data(), Some(1));
        assert!(request.error().is_none());

        assert_eq!(request.refresh_async().await.unwrap(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stale_cache_until_cache_time() {
        let runtime = VolleyRuntime::new();
        let (service, counter) = delayed_echo(Duration::from_millis(100), 1);
        let options = manual()
            .cache_key("x")
            .cache_time(Ttl::For(Duration::from_secs(10)))
            .stale_time(Ttl::Forever);
        let request = runtime.use_request(service, options, &[]).unwrap();

        request.run_async(1).await.unwrap();
        assert_eq!(request.data(), Some(1));

        request.run_async(2).await.unwrap();
        assert_eq!(request.data(), Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(10_050)).await;
        request.run_async(2).await.unwrap();
        assert_eq!(request.data(), Some(2));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_key_converges_on_first_result() {
        let runtime = VolleyRuntime::new();
        let (first, first_calls) = delayed_echo(Duration::from_millis(100), 10);
        let (second, second_calls) = delayed_echo(Duration::from_millis(100), 100);
        let options = || manual().cache_key("shared").stale_time(Ttl::Forever);

        let a = runtime.use_request(first, options(), &[]).unwrap();
        let b = runtime.use_request(second, options(), &[]).unwrap();

        let (ra, rb) = tokio::join!(a.run_async(1), b.run_async(1));
        assert_eq!(ra.unwrap(), Some(10));
        assert_eq!(rb.unwrap(), Some(10));
        assert_eq!(
            first_calls.load(Ordering::SeqCst) + second_calls.load(Ordering::SeqCst),
            1
        );

        a.mutate(7);
        assert_eq!(b.data(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fires_error_four_times() {
        let runtime = VolleyRuntime::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let finals = Arc::new(AtomicUsize::new(0));
        let (e, f) = (Arc::clone(&errors), Arc::clone(&finals));

        let options = manual()
            .retry_count(RetryCount::Times(3))
            .on_error(move |_, _| {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .on_finally(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        let failing = |_: u32| async { Err::<u32, BoxError>("boom".into()) };
        let request = runtime.use_request(failing, options, &[]).unwrap();

        assert!(request.run_async(1).await.is_err());
        sleep(Duration::from_secs(2 + 4 + 8 + 1)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 4);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 4);
        assert_eq!(finals.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_global_plugins_follow_priority() {
        let runtime = VolleyRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name: &'static str| {
            let log = Arc::clone(&log);
            plugin_fn(name, move |_| {
                let log = Arc::clone(&log);
                Ok(Box::new(HookMap::new().on_before(move |_: &AnyValue| {
                    log.lock().push(name);
                    BeforeOutcome::proceed()
                })) as Box<dyn volley_core::RequestHooks>)
            })
        };

        runtime.define_plugins(
            vec![recorder("c"), recorder("a"), recorder("b")],
            [("b", 15), ("c", 25), ("a", 5)],
        );
        let (service, _) = delayed_echo(Duration::ZERO, 1);
        let request = runtime.use_request(service, manual(), &[]).unwrap();
        request.run_async(1).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_plugin_failure_aborts_construction() {
        let runtime = VolleyRuntime::new();
        let broken = plugin_fn("broken", |_| Err("no".into()));
        let (service, _) = delayed_echo(Duration::ZERO, 1);

        let err = runtime
            .use_request(service, manual().id("broken"), &[broken])
            .unwrap_err();
        assert!(matches!(err, crate::RuntimeError::Build(_)));
        assert!(runtime.get_core("broken").is_none());
    }

    #[tokio::test]
    async fn test_middleware_ambient_outermost() {
        let runtime = VolleyRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let tracer = |name: &'static str| -> Arc<dyn Middleware> {
            let log = Arc::clone(&log);
            middleware_fn(name, move |next: BuildFn| -> BuildFn {
                let log = Arc::clone(&log);
                Arc::new(
                    move |service: ErasedService,
                          options: RequestOptions,
                          plugins: Vec<Arc<dyn PluginFactory>>| {
                        log.lock().push(format!("{name} enter"));
                        let built = next(service, options, plugins);
                        log.lock().push(format!("{name} exit"));
                        built
                    },
                )
            })
        };

        runtime.configure(RequestOptions {
            middleware: vec![tracer("ambient")],
            ..RequestOptions::new()
        });
        let (service, _) = delayed_echo(Duration::ZERO, 1);
        runtime
            .use_request(service, manual().middleware(tracer("local")), &[])
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["ambient enter", "local enter", "local exit", "ambient exit"]
        );
    }

    #[tokio::test]
    async fn test_middleware_rewrites_service() {
        let runtime = VolleyRuntime::new();
        let doubling = middleware_fn("double", |next: BuildFn| -> BuildFn {
            Arc::new(
                move |service: ErasedService,
                      options: RequestOptions,
                      plugins: Vec<Arc<dyn PluginFactory>>| {
                    let doubled = BoxCloneSyncService::new(service_fn(move |p: AnyValue| {
                        service.clone().oneshot(p).map_ok(|out| {
                            let n = volley_core::downcast::<u32>(&out).unwrap_or_default();
                            volley_core::erase(n * 2)
                        })
                    }));
                    next(doubled, options, plugins)
                },
            )
        });

        let (service, _) = delayed_echo(Duration::ZERO, 1);
        let request = runtime
            .use_request(service, manual().middleware(doubling), &[])
            .unwrap();
        assert_eq!(request.run_async(21).await.unwrap(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_middleware_timeout() {
        use tower::timeout::TimeoutLayer;
        use volley_core::{LayerMiddleware, RequestError};

        let runtime = VolleyRuntime::new();
        let timeout = Arc::new(LayerMiddleware::new(
            "timeout",
            TimeoutLayer::new(Duration::from_millis(100)),
        )) as Arc<dyn Middleware>;
        runtime.configure(RequestOptions {
            middleware: vec![timeout],
            ..RequestOptions::new()
        });

        let (slow, _) = delayed_echo(Duration::from_secs(1), 1);
        let request = runtime.use_request(slow, manual(), &[]).unwrap();
        let err = request.run_async(1).await.unwrap_err();
        assert!(matches!(err, RequestError::Service(_)));
        assert!(request.error().is_some());

        let (fast, _) = delayed_echo(Duration::from_millis(10), 1);
        let request = runtime.use_request(fast, manual(), &[]).unwrap();
        assert_eq!(request.run_async(5).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_id_registry_follows_dispose() {
        let runtime = VolleyRuntime::new();
        let (s1, _) = delayed_echo(Duration::ZERO, 1);
        let (s2, _) = delayed_echo(Duration::ZERO, 1);

        let first = runtime.use_request(s1, manual().id("user"), &[]).unwrap();
        assert!(runtime.get_request::<u32, u32>("user").is_some());

        let second = runtime.use_request(s2, manual().id("user"), &[]).unwrap();
        first.dispose();
        let found = runtime.get_core("user").map(|c| c.id());
        assert_eq!(found, Some(second.core().id()));

        second.dispose();
        assert!(runtime.get_core("user").is_none());
        assert!(!runtime.remove_request("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache() {
        let runtime = VolleyRuntime::new();
        let (service, counter) = delayed_echo(Duration::from_millis(10), 1);
        let request = runtime
            .use_request(service, manual().cache_key("k").stale_time(Ttl::Forever), &[])
            .unwrap();

        request.run_async(1).await.unwrap();
        assert!(runtime.cache_store().contains("k"));

        runtime.clear_cache(&["k"]);
        assert!(!runtime.cache_store().contains("k"));

        request.run_async(1).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        runtime.clear_all_cache();
        assert!(runtime.cache_store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_tick_waits_for_pending_call() {
        let runtime = VolleyRuntime::new();
        let (service, _) = delayed_echo(Duration::from_millis(100), 1);
        let request = runtime.use_request(service, manual(), &[]).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);

        request.run(1);
        tokio::task::yield_now().await;

        let mut tick = tokio_test::task::spawn(request.request_tick(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_pending!(tick.poll());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(150)).await;
        assert!(tick.is_woken());
        assert_ready!(tick.poll());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Nothing pending: resolves immediately.
        let mut idle = tokio_test::task::spawn(request.tick());
        assert_ready!(idle.poll());
    }

    #[tokio::test]
    async fn test_from_config_installs_defaults() {
        let mut config = VolleyConfig::default();
        config.defaults = RequestDefaults {
            manual: Some(true),
            stale_time_ms: Some(-1),
            ..RequestDefaults::default()
        };

        let runtime = VolleyRuntime::from_config(&config);
        let ambient = runtime.global_config();
        assert!(ambient.is_manual());
        assert_eq!(ambient.stale_time, Some(Ttl::Forever));

        let (service, counter) = delayed_echo(Duration::ZERO, 1);
        let request = runtime.use_request(service, Options::new(), &[]).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(request.data().is_none());
    }

    #[test]
    fn test_base_plugins_registered() {
        let runtime = VolleyRuntime::new();
        assert_eq!(runtime.plugins().base_names().len(), BASE_PRIORITIES.len());
        assert!(runtime.services().contains::<CacheStore>());
        assert!(runtime.services().contains::<VisibilityBus>());
    }
}
