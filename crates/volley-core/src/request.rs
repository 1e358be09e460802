//! Typed request handles and options.
//!
//! The engine, plugins and cache speak [`AnyValue`]. This module is the
//! typed edge: [`Options`] builds a [`RequestOptions`] from typed callbacks,
//! [`erase_service`] turns a typed async function into an
//! [`ErasedService`], and [`Request`] downcasts state and results back.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tower::service_fn;
use tower::util::BoxCloneSyncService;

use crate::cache::{CacheBackend, Ttl};
use crate::cell::{Cell, Observable, Subscription};
use crate::engine::{ErasedService, RequestCore, Status};
use crate::error::{BoxError, RequestError, RequestResult};
use crate::middleware::Middleware;
use crate::options::{
    CacheKey, DebounceOptions, ParamsSource, Ready, RequestOptions, RetryCount, ThrottleOptions,
};
use crate::value::{AnyValue, downcast, erase};

/// Erases a typed async service.
///
/// A call without params reaches the service as `()`, so a `Fn(())`
/// service runs with no defaults configured. Any other `P` then resolves
/// with [`RequestError::MissingParams`]; params that fail to downcast to `P`
/// resolve with [`RequestError::TypeMismatch`].
pub fn erase_service<S, F, R, P>(service: S) -> ErasedService
where
    S: Fn(P) -> F + Send + Sync + 'static,
    F: Future<Output = Result<R, BoxError>> + Send + 'static,
    R: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    let service = Arc::new(service);
    BoxCloneSyncService::new(service_fn(move |params: AnyValue| {
        let call = downcast::<P>(&params).ok_or_else(|| {
            if params.is::<()>() {
                RequestError::MissingParams
            } else {
                RequestError::type_mismatch::<P>()
            }
        });
        let call = call.map(|p| service(p));
        async move {
            match call {
                Ok(call) => call.await.map(erase),
                Err(err) => Err(Box::new(err) as BoxError),
            }
        }
    }))
}

fn typed<T: Clone + 'static>(value: RequestResult<AnyValue>) -> RequestResult<T> {
    match value? {
        Some(v) => downcast::<T>(&v)
            .map(Some)
            .ok_or_else(RequestError::type_mismatch::<T>),
        None => Ok(None),
    }
}

// =============================================================================
// Options
// =============================================================================

/// Typed builder for [`RequestOptions`].
///
/// ```rust,ignore
/// let options = Options::<User, u64>::new()
///     .manual(true)
///     .cache_key("user")
///     .stale_time(Ttl::Forever)
///     .on_success(|user, id| tracing::info!(%id, name = %user.name, "loaded"));
/// ```
pub struct Options<R, P> {
    raw: RequestOptions,
    _marker: PhantomData<fn() -> (R, P)>,
}

impl<R, P> Default for Options<R, P> {
    fn default() -> Self {
        Self {
            raw: RequestOptions::default(),
            _marker: PhantomData,
        }
    }
}

impl<R, P> Clone for Options<R, P> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, P> std::fmt::Debug for Options<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.raw, f)
    }
}

impl<R, P> From<RequestOptions> for Options<R, P> {
    fn from(raw: RequestOptions) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }
}

impl<R, P> Options<R, P>
where
    R: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> &RequestOptions {
        &self.raw
    }

    pub fn into_raw(self) -> RequestOptions {
        self.raw
    }

    pub fn manual(mut self, manual: bool) -> Self {
        self.raw.manual = Some(manual);
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.raw.id = Some(id.into());
        self
    }

    pub fn default_params(mut self, params: P) -> Self {
        self.raw.default_params = Some(ParamsSource::Value(erase(params)));
        self
    }

    /// Default params recomputed on every run without explicit params.
    pub fn default_params_with(mut self, f: impl Fn() -> P + Send + Sync + 'static) -> Self {
        self.raw.default_params = Some(ParamsSource::Producer(Arc::new(move || erase(f()))));
        self
    }

    pub fn default_data(mut self, data: R) -> Self {
        self.raw.default_data = Some(erase(data));
        self
    }

    pub fn on_before(mut self, f: impl Fn(&P) + Send + Sync + 'static) -> Self {
        self.raw.on_before = Some(Arc::new(move |params: &AnyValue| {
            if let Some(p) = params.downcast_ref::<P>() {
                f(p);
            }
        }));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&R, &P) + Send + Sync + 'static) -> Self {
        self.raw.on_success = Some(Arc::new(move |data: &AnyValue, params: &AnyValue| {
            if let (Some(d), Some(p)) = (data.downcast_ref::<R>(), params.downcast_ref::<P>()) {
                f(d, p);
            }
            None
        }));
        self
    }

    /// Like [`on_success`](Self::on_success); the returned value replaces the
    /// result before it is written to `data`.
    pub fn map_success(mut self, f: impl Fn(&R, &P) -> R + Send + Sync + 'static) -> Self {
        self.raw.on_success = Some(Arc::new(move |data: &AnyValue, params: &AnyValue| {
            match (data.downcast_ref::<R>(), params.downcast_ref::<P>()) {
                (Some(d), Some(p)) => Some(erase(f(d, p))),
                _ => None,
            }
        }));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&RequestError, &P) + Send + Sync + 'static) -> Self {
        self.raw.on_error = Some(Arc::new(move |err: &RequestError, params: &AnyValue| {
            if let Some(p) = params.downcast_ref::<P>() {
                f(err, p);
            }
        }));
        self
    }

    pub fn on_finally(mut self, f: impl Fn(&P) + Send + Sync + 'static) -> Self {
        self.raw.on_finally = Some(Arc::new(move |params: &AnyValue| {
            if let Some(p) = params.downcast_ref::<P>() {
                f(p);
            }
        }));
        self
    }

    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.raw.on_cancel = Some(Arc::new(f));
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.raw.ready = Some(Ready::Value(ready));
        self
    }

    /// Gates on a reactive flag; turning it on triggers a run.
    pub fn ready_when(mut self, ready: Cell<bool>) -> Self {
        self.raw.ready = Some(Ready::Cell(ready));
        self
    }

    pub fn ready_fn(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.raw.ready = Some(Ready::Fn(Arc::new(f)));
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.raw.cache_key = Some(CacheKey::Static(key.into()));
        self
    }

    /// Derives the cache key from the call's params.
    pub fn cache_key_with(
        mut self,
        f: impl Fn(Option<&P>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.raw.cache_key = Some(CacheKey::Dynamic(Arc::new(
            move |params: Option<&AnyValue>| f(params.and_then(|p| p.downcast_ref::<P>())),
        )));
        self
    }

    pub fn cache_time(mut self, ttl: Ttl) -> Self {
        self.raw.cache_time = Some(ttl);
        self
    }

    pub fn stale_time(mut self, ttl: Ttl) -> Self {
        self.raw.stale_time = Some(ttl);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheBackend>) -> Self {
        self.raw.cache_store = Some(store);
        self
    }

    pub fn loading_delay(mut self, delay: Duration) -> Self {
        self.raw.loading_delay = Some(delay);
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.raw.polling_interval = Some(interval);
        self
    }

    pub fn polling_error_retry_count(mut self, count: u32) -> Self {
        self.raw.polling_error_retry_count = Some(count);
        self
    }

    pub fn polling_when_hidden(mut self, enabled: bool) -> Self {
        self.raw.polling_when_hidden = Some(enabled);
        self
    }

    pub fn retry_count(mut self, count: RetryCount) -> Self {
        self.raw.retry_count = Some(count);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.raw.retry_interval = Some(interval);
        self
    }

    pub fn debounce(mut self, wait: Duration) -> Self {
        self.raw.debounce_wait = Some(wait);
        self
    }

    pub fn debounce_with(mut self, wait: Duration, options: DebounceOptions) -> Self {
        self.raw.debounce_wait = Some(wait);
        self.raw.debounce_options = Some(options);
        self
    }

    pub fn throttle(mut self, wait: Duration) -> Self {
        self.raw.throttle_wait = Some(wait);
        self
    }

    pub fn throttle_with(mut self, wait: Duration, options: ThrottleOptions) -> Self {
        self.raw.throttle_wait = Some(wait);
        self.raw.throttle_options = Some(options);
        self
    }

    /// Refreshes whenever `dep` changes.
    pub fn refresh_dep(mut self, dep: impl Observable + 'static) -> Self {
        self.raw.refresh_deps.push(Arc::new(dep));
        self
    }

    /// Runs with these params, instead of refreshing, on a dependency change.
    pub fn refresh_deps_params(mut self, f: impl Fn() -> P + Send + Sync + 'static) -> Self {
        self.raw.refresh_deps_params = Some(ParamsSource::Producer(Arc::new(move || erase(f()))));
        self
    }

    pub fn refresh_on_window_focus(mut self, enabled: bool) -> Self {
        self.raw.refresh_on_window_focus = Some(enabled);
        self
    }

    pub fn cancel_on_window_blur(mut self, enabled: bool) -> Self {
        self.raw.cancel_on_window_blur = Some(enabled);
        self
    }

    pub fn focus_timespan(mut self, span: Duration) -> Self {
        self.raw.focus_timespan = Some(span);
        self
    }

    /// Appends a construction middleware.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.raw.middleware.push(middleware);
        self
    }

    /// Sets a key no built-in plugin recognizes; every plugin sees it.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw.extra.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Request
// =============================================================================

/// A typed request instance.
///
/// Cheap to clone; every clone drives the same instance.
pub struct Request<R, P> {
    core: RequestCore,
    _marker: PhantomData<fn() -> (R, P)>,
}

impl<R, P> Clone for Request<R, P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, P> std::fmt::Debug for Request<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Request").field(&self.core).finish()
    }
}

impl<R, P> Request<R, P>
where
    R: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Wraps an erased instance.
    pub fn from_core(core: RequestCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub fn core(&self) -> &RequestCore {
        &self.core
    }

    pub fn data(&self) -> Option<R> {
        self.core.state().data.with(|d| d.as_ref().and_then(downcast::<R>))
    }

    pub fn loading(&self) -> bool {
        self.core.state().loading.get()
    }

    pub fn error(&self) -> Option<RequestError> {
        self.core.state().error.get()
    }

    pub fn params(&self) -> Option<P> {
        self.core.state().params.with(|p| p.as_ref().and_then(downcast::<P>))
    }

    pub fn status(&self) -> Status {
        self.core.state().status.get()
    }

    pub fn polling_count(&self) -> u64 {
        self.core.state().polling_count.get()
    }

    pub fn run(&self, params: P) {
        self.core.run(Some(erase(params)));
    }

    pub fn run_async(&self, params: P) -> BoxFuture<'static, RequestResult<R>> {
        self.core.run_async(Some(erase(params))).map(typed::<R>).boxed()
    }

    pub fn refresh(&self) {
        self.core.refresh();
    }

    pub fn refresh_async(&self) -> BoxFuture<'static, RequestResult<R>> {
        self.core.refresh_async().map(typed::<R>).boxed()
    }

    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn mutate(&self, data: R) {
        self.core.mutate(erase(data));
    }

    /// Overwrites `data` with `f(previous)`.
    pub fn mutate_with(&self, f: impl FnOnce(Option<R>) -> R) {
        self.core
            .mutate_with(|prev| erase(f(prev.as_ref().and_then(downcast::<R>))));
    }

    pub fn tick(&self) -> BoxFuture<'static, ()> {
        self.core.tick()
    }

    pub fn request_tick(&self, callback: impl FnOnce() + Send + 'static) -> BoxFuture<'static, ()> {
        self.core.request_tick(callback)
    }

    /// Calls `f` with the new data after every write.
    pub fn watch_data(&self, f: impl Fn(Option<R>) + Send + Sync + 'static) -> Subscription {
        self.core
            .state()
            .data
            .subscribe(move |d| f(d.as_ref().and_then(downcast::<R>)))
    }

    pub fn watch_loading(&self, f: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.core.state().loading.subscribe(move |v| f(*v))
    }

    pub fn watch_status(&self, f: impl Fn(Status) + Send + Sync + 'static) -> Subscription {
        self.core.state().status.subscribe(move |v| f(*v))
    }

    /// Cancels and releases everything the instance holds.
    pub fn dispose(&self) {
        self.core.dispose();
    }
}
