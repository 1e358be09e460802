//! The execution engine.
//!
//! A [`RequestCore`] owns one instance's state cells, its plugin hooks and
//! its entry point. Every execution captures a generation number; only a
//! call whose generation is still current when it completes may touch
//! visible state or fire completion hooks. Starting a newer call or
//! cancelling advances the generation, so the last started call wins and
//! cancellation beats any call in flight.
//!
//! The synchronous part of an execution (state writes, the `on_before`
//! merge, short-circuiting, `on_init` composition) runs when
//! [`run_async`](RequestCore::run_async) is called. Only the wait for the
//! service and the completion bookkeeping live in the returned future.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::future::{self, BoxFuture, Shared};
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tower::Service;
use tower::util::BoxCloneSyncService;
use tracing::{debug, error, trace, warn};

use crate::cell::Cell;
use crate::error::{BoxError, BuildError, BuildResult, RequestError, RequestResult};
use crate::hook::{HookChain, RequestHooks, RunFn, ServiceCall};
use crate::options::{ParamsSource, RequestOptions};
use crate::plugin::{PluginContext, PluginFactory, Services};
use crate::value::{AnyValue, erase};

/// A type-erased service: params in, value out.
pub type ErasedService = BoxCloneSyncService<AnyValue, AnyValue, BoxError>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static EMPTY_CHAIN: HookChain = HookChain::empty();

// =============================================================================
// State
// =============================================================================

/// Whether the latest execution has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Pending,
    Settled,
}

/// The observable state of one instance.
pub struct RequestState {
    /// Last accepted result, or the default data.
    pub data: Cell<Option<AnyValue>>,
    /// Independent of `status`; plugins may suppress it.
    pub loading: Cell<bool>,
    /// Last failure, cleared by the next success.
    pub error: Cell<Option<RequestError>>,
    /// Params of the most recent execution.
    pub params: Cell<Option<AnyValue>>,
    pub status: Cell<Status>,
    pub polling_count: Cell<u64>,
}

impl RequestState {
    fn new(options: &RequestOptions) -> Self {
        Self {
            data: Cell::new(options.default_data.clone()),
            loading: Cell::new(false),
            error: Cell::new(None),
            params: Cell::new(options.default_params.as_ref().map(ParamsSource::resolve)),
            status: Cell::new(Status::Pending),
            polling_count: Cell::new(0),
        }
    }
}

impl std::fmt::Debug for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestState")
            .field("has_data", &self.data.with(Option::is_some))
            .field("loading", &self.loading.get())
            .field("error", &self.error.get())
            .field("status", &self.status.get())
            .field("polling_count", &self.polling_count.get())
            .finish()
    }
}

// =============================================================================
// Tick
// =============================================================================

type TickCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TickWaiters {
    fired: bool,
    callbacks: Vec<TickCallback>,
}

/// Completion signal of one execution.
#[derive(Clone)]
struct Tick {
    done: Shared<oneshot::Receiver<()>>,
    waiters: Arc<Mutex<TickWaiters>>,
}

#[derive(Default)]
struct Control {
    generation: u64,
    pending: usize,
    tick: Option<Tick>,
}

/// Completion bookkeeping of one execution.
///
/// Settles on [`settle`](Self::settle) or, if the execution future is
/// dropped early, on drop.
struct CallGuard {
    core: Weak<CoreInner>,
    generation: u64,
    tx: Option<oneshot::Sender<()>>,
    waiters: Arc<Mutex<TickWaiters>>,
    settled: bool,
}

impl CallGuard {
    fn settle(&mut self) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        if let Some(inner) = self.core.upgrade() {
            let (current, idle) = {
                let mut control = inner.control.lock();
                control.pending = control.pending.saturating_sub(1);
                (control.generation == self.generation, control.pending == 0)
            };
            if current {
                inner.state.loading.set(false);
                inner.state.status.set(Status::Settled);
            } else if idle {
                inner.state.status.set(Status::Settled);
            }
        }

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
        let callbacks = {
            let mut waiters = self.waiters.lock();
            waiters.fired = true;
            std::mem::take(&mut waiters.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.settle();
    }
}

// =============================================================================
// RequestCore
// =============================================================================

struct CoreInner {
    id: u64,
    service: ErasedService,
    options: RequestOptions,
    state: RequestState,
    control: Mutex<Control>,
    hooks: OnceLock<HookChain>,
    entry: OnceLock<RunFn>,
    disposed: AtomicBool,
    teardown: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// One request instance: state cells, execution engine and bound plugins.
///
/// Cloning yields another handle to the same instance.
#[derive(Clone)]
pub struct RequestCore {
    inner: Arc<CoreInner>,
}

impl RequestCore {
    /// Creates an instance without plugins.
    pub fn new(service: ErasedService, options: RequestOptions) -> Self {
        let core = Self::bare(service, options);
        core.install(HookChain::default());
        core
    }

    /// Creates an instance, building every plugin's hooks in order.
    ///
    /// Fails fast on the first plugin factory error.
    pub fn with_plugins(
        service: ErasedService,
        options: RequestOptions,
        plugins: &[Arc<dyn PluginFactory>],
        services: &Services,
    ) -> BuildResult<Self> {
        let core = Self::bare(service, options);
        let handle = core.handle();

        let mut hooks: Vec<Box<dyn RequestHooks>> = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            let ctx = PluginContext::new(handle.clone(), &core.inner.options, services);
            let built = plugin.build(&ctx).map_err(|source| BuildError::PluginInit {
                plugin: plugin.name().to_owned(),
                source,
            })?;
            hooks.push(built);
        }

        core.install(HookChain::new(hooks));
        debug!(request = core.id(), plugins = plugins.len(), "Request instance created");
        Ok(core)
    }

    fn bare(service: ErasedService, options: RequestOptions) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                service,
                state: RequestState::new(&options),
                options,
                control: Mutex::new(Control::default()),
                hooks: OnceLock::new(),
                entry: OnceLock::new(),
                disposed: AtomicBool::new(false),
                teardown: Mutex::new(Vec::new()),
            }),
        }
    }

    fn install(&self, chain: HookChain) {
        let weak = Arc::downgrade(&self.inner);
        let base: RunFn = Arc::new(move |params| match weak.upgrade() {
            Some(inner) => RequestCore { inner }.execute(params),
            None => future::ready(Err(RequestError::Disposed)).boxed(),
        });
        let entry = chain.wrap_run(base);
        let _ = self.inner.hooks.set(chain);
        let _ = self.inner.entry.set(entry);
    }

    fn hooks(&self) -> &HookChain {
        self.inner.hooks.get().unwrap_or(&EMPTY_CHAIN)
    }

    /// Process-unique numeric identity of this instance.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> &RequestState {
        &self.inner.state
    }

    pub fn options(&self) -> &RequestOptions {
        &self.inner.options
    }

    /// A weak handle for plugins and timers.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.inner.control.lock().generation
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Starts an execution through the plugin-decorated entry point.
    ///
    /// `Some(params)` are adopted as the instance's params; `None` reuses a
    /// producer default, the current params, or the static default.
    pub fn run_async(&self, params: Option<AnyValue>) -> BoxFuture<'static, RequestResult<AnyValue>> {
        match self.inner.entry.get() {
            Some(entry) => entry(params),
            None => self.execute(params),
        }
    }

    /// Fire-and-forget [`run_async`](Self::run_async).
    ///
    /// Failures are logged only when no user `on_error` is configured.
    pub fn run(&self, params: Option<AnyValue>) {
        let call = self.run_async(params);
        let silent = self.inner.options.on_error.is_some();
        let id = self.inner.id;

        let task = async move {
            match call.await {
                Err(RequestError::Disposed) => {}
                Err(err) if !silent => error!(request = id, error = %err, "Request failed"),
                _ => {}
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => warn!(request = id, "No Tokio runtime; run() dropped"),
        }
    }

    /// Re-runs with the current params.
    pub fn refresh(&self) {
        self.run(self.inner.state.params.get());
    }

    pub fn refresh_async(&self) -> BoxFuture<'static, RequestResult<AnyValue>> {
        self.run_async(self.inner.state.params.get())
    }

    /// Invalidates the in-flight call and fires `on_cancel`.
    ///
    /// The underlying operation keeps running; its outcome is discarded.
    pub fn cancel(&self) {
        {
            let mut control = self.inner.control.lock();
            control.generation += 1;
        }
        self.inner.state.loading.set(false);
        self.hooks().cancel();
        if let Some(on_cancel) = &self.inner.options.on_cancel {
            on_cancel();
        }
        trace!(request = self.inner.id, "Request cancelled");
    }

    /// Overwrites `data` without calling the service, then fires `on_mutate`.
    pub fn mutate(&self, data: AnyValue) {
        self.inner.state.data.set(Some(Arc::clone(&data)));
        self.hooks().mutate(&data);
    }

    /// Like [`mutate`](Self::mutate) with an updater over the previous value.
    pub fn mutate_with(&self, f: impl FnOnce(Option<AnyValue>) -> AnyValue) {
        let next = f(self.inner.state.data.get());
        self.mutate(next);
    }

    /// Resolves once the latest execution settles, or immediately when
    /// nothing is pending.
    pub fn tick(&self) -> BoxFuture<'static, ()> {
        self.request_tick(|| {})
    }

    /// Like [`tick`](Self::tick), also invoking `callback` at that point.
    ///
    /// The callback runs even if the returned future is never awaited.
    pub fn request_tick(&self, callback: impl FnOnce() + Send + 'static) -> BoxFuture<'static, ()> {
        let tick = {
            let control = self.inner.control.lock();
            if control.pending == 0 {
                None
            } else {
                control.tick.clone()
            }
        };
        let Some(tick) = tick else {
            callback();
            return future::ready(()).boxed();
        };

        {
            let mut waiters = tick.waiters.lock();
            if !waiters.fired {
                waiters.callbacks.push(Box::new(callback));
                drop(waiters);
                return async move {
                    let _ = tick.done.await;
                }
                .boxed();
            }
        }
        callback();
        future::ready(()).boxed()
    }

    /// Registers a callback run once by [`dispose`](Self::dispose).
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            f();
            return;
        }
        self.inner.teardown.lock().push(Box::new(f));
    }

    /// Host teardown: cancels and runs every dispose callback. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel();
        let teardown = std::mem::take(&mut *self.inner.teardown.lock());
        for f in teardown {
            f();
        }
        debug!(request = self.inner.id, "Request disposed");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Explicit args, else the default producer, else the last params, else
    /// the static default, else no params at all (`()`).
    fn resolve_params(&self, args: Option<AnyValue>) -> AnyValue {
        if let Some(args) = args {
            return args;
        }
        match &self.inner.options.default_params {
            Some(source) if source.is_producer() => source.resolve(),
            source => self
                .inner
                .state
                .params
                .get()
                .or_else(|| source.as_ref().map(ParamsSource::resolve))
                .unwrap_or_else(|| erase(())),
        }
    }

    /// The service is only called when the returned future is first polled.
    fn service_call(&self, params: &AnyValue) -> ServiceCall {
        let mut service = self.inner.service.clone();
        let params = Arc::clone(params);
        future::lazy(move |_| Service::call(&mut service, params))
            .flatten()
            .map_err(RequestError::service)
            .boxed()
    }

    /// One undecorated execution.
    fn execute(&self, args: Option<AnyValue>) -> BoxFuture<'static, RequestResult<AnyValue>> {
        if self.is_disposed() {
            return future::ready(Err(RequestError::Disposed)).boxed();
        }
        let inner = &self.inner;
        let state = &inner.state;

        state.loading.set(true);
        let params = self.resolve_params(args);
        state.params.set(Some(Arc::clone(&params)));
        state.status.set(Status::Pending);

        let (tx, rx) = oneshot::channel();
        let waiters = Arc::new(Mutex::new(TickWaiters::default()));
        let generation = {
            let mut control = inner.control.lock();
            control.generation += 1;
            control.pending += 1;
            control.tick = Some(Tick {
                done: rx.shared(),
                waiters: Arc::clone(&waiters),
            });
            control.generation
        };
        let mut guard = CallGuard {
            core: Arc::downgrade(inner),
            generation,
            tx: Some(tx),
            waiters,
            settled: false,
        };
        trace!(request = inner.id, generation, "Execution started");

        let outcome = self.hooks().before(&params);
        if let Some(data) = &outcome.return_data {
            state.data.set(Some(Arc::clone(data)));
        }
        if outcome.is_short_circuit() {
            guard.settle();
            trace!(request = inner.id, generation, "Execution short-circuited");
            return future::ready(Ok(outcome.return_data)).boxed();
        }

        if let Some(on_before) = &inner.options.on_before {
            on_before(&params);
        }
        let call = self.hooks().init(&params, self.service_call(&params));

        let weak = Arc::downgrade(inner);
        async move {
            let result = call.await;
            let Some(inner) = weak.upgrade() else {
                return Ok(None);
            };
            let core = RequestCore { inner };
            core.complete(generation, &params, result, guard)
        }
        .boxed()
    }

    fn complete(
        &self,
        generation: u64,
        params: &AnyValue,
        result: Result<AnyValue, RequestError>,
        mut guard: CallGuard,
    ) -> RequestResult<AnyValue> {
        let current = self.generation() == generation;
        if !current {
            trace!(request = self.inner.id, generation, "Stale completion discarded");
            guard.settle();
            return Ok(None);
        }

        let state = &self.inner.state;
        let options = &self.inner.options;
        let hooks = self.hooks();

        let out = match result {
            Ok(value) => {
                state.error.set(None);
                let value = match &options.on_success {
                    Some(on_success) => on_success(&value, params).unwrap_or(value),
                    None => value,
                };
                state.data.set(Some(Arc::clone(&value)));
                hooks.success(&value, params);
                Ok(Some(value))
            }
            Err(err) => {
                state.error.set(Some(err.clone()));
                hooks.error(&err, params);
                if let Some(on_error) = &options.on_error {
                    on_error(&err, params);
                }
                Err(err)
            }
        };

        guard.settle();
        hooks.finally(params);
        if let Some(on_finally) = &options.on_finally {
            on_finally(params);
        }
        out
    }
}

impl std::fmt::Debug for RequestCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCore")
            .field("id", &self.inner.id)
            .field("options", &self.inner.options)
            .field("state", &self.inner.state)
            .field("hooks", self.hooks())
            .finish()
    }
}

// =============================================================================
// RequestHandle
// =============================================================================

/// A weak handle to an instance, held by plugins and their timers.
///
/// Every operation is a no-op once the instance is gone.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Weak<CoreInner>,
    id: u64,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn upgrade(&self) -> Option<RequestCore> {
        self.inner.upgrade().map(|inner| RequestCore { inner })
    }

    /// Returns `true` while the instance exists and is not disposed.
    pub fn is_alive(&self) -> bool {
        self.upgrade().is_some_and(|core| !core.is_disposed())
    }

    /// Current generation, or `None` once the instance is gone.
    pub fn generation(&self) -> Option<u64> {
        self.upgrade().map(|c| c.generation())
    }

    pub fn status(&self) -> Option<Status> {
        self.upgrade().map(|c| c.state().status.get())
    }

    pub fn loading(&self) -> bool {
        self.upgrade().is_some_and(|c| c.state().loading.get())
    }

    pub fn set_loading(&self, loading: bool) {
        if let Some(core) = self.upgrade() {
            core.state().loading.set(loading);
        }
    }

    pub fn polling_count(&self) -> u64 {
        self.upgrade().map_or(0, |c| c.state().polling_count.get())
    }

    pub fn set_polling_count(&self, count: u64) {
        if let Some(core) = self.upgrade() {
            core.state().polling_count.set(count);
        }
    }

    pub fn increment_polling_count(&self) {
        if let Some(core) = self.upgrade() {
            core.state().polling_count.update(|n| *n += 1);
        }
    }

    pub fn params(&self) -> Option<AnyValue> {
        self.upgrade().and_then(|c| c.state().params.get())
    }

    pub fn data(&self) -> Option<AnyValue> {
        self.upgrade().and_then(|c| c.state().data.get())
    }

    /// Writes `data` directly, without firing `on_mutate`.
    pub fn set_data(&self, data: Option<AnyValue>) {
        if let Some(core) = self.upgrade() {
            core.state().data.set(data);
        }
    }

    pub fn run(&self, params: Option<AnyValue>) {
        if let Some(core) = self.upgrade() {
            core.run(params);
        }
    }

    pub fn run_async(&self, params: Option<AnyValue>) -> BoxFuture<'static, RequestResult<AnyValue>> {
        match self.upgrade() {
            Some(core) => core.run_async(params),
            None => future::ready(Err(RequestError::Disposed)).boxed(),
        }
    }

    pub fn refresh(&self) {
        if let Some(core) = self.upgrade() {
            core.refresh();
        }
    }

    pub fn cancel(&self) {
        if let Some(core) = self.upgrade() {
            core.cancel();
        }
    }

    /// See [`RequestCore::on_dispose`].
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        if let Some(core) = self.upgrade() {
            core.on_dispose(f);
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tower::service_fn;

    use super::*;
    use crate::hook::{BeforeOutcome, HookMap};
    use crate::plugin::plugin_fn;
    use crate::value::{downcast, erase};

    /// A service that sleeps `param` milliseconds and echoes it.
    pub(crate) fn echo_after_ms() -> ErasedService {
        BoxCloneSyncService::new(service_fn(|p: AnyValue| async move {
            let ms = downcast::<u64>(&p).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, BoxError>(p)
        }))
    }

    fn data_of(core: &RequestCore) -> Option<u64> {
        core.state().data.get().as_ref().and_then(downcast::<u64>)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_transitions_state() {
        let core = RequestCore::new(echo_after_ms(), RequestOptions::new());
        let loading = Arc::new(Mutex::new(Vec::new()));
        let loading2 = Arc::clone(&loading);
        let _sub = core.state().loading.subscribe(move |v| loading2.lock().push(*v));

        assert!(!core.state().loading.get());
        let call = core.run_async(Some(erase(1000u64)));
        assert!(core.state().loading.get());
        assert_eq!(core.state().status.get(), Status::Pending);

        let out = call.await.unwrap();
        assert_eq!(out.as_ref().and_then(downcast::<u64>), Some(1000));
        assert_eq!(data_of(&core), Some(1000));
        assert_eq!(core.state().status.get(), Status::Settled);
        assert_eq!(*loading.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_call_wins_race() {
        let core = RequestCore::new(echo_after_ms(), RequestOptions::new());

        let slow = core.run_async(Some(erase(300u64)));
        let fast = core.run_async(Some(erase(100u64)));
        let (slow, fast) = futures::join!(slow, fast);

        assert!(matches!(slow, Ok(None)));
        assert_eq!(fast.unwrap().as_ref().and_then(downcast::<u64>), Some(100));
        assert_eq!(data_of(&core), Some(100));
        assert_eq!(core.state().status.get(), Status::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_call() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled2 = Arc::clone(&cancelled);
        let mut options = RequestOptions::new();
        options.on_cancel = Some(Arc::new(move || {
            cancelled2.fetch_add(1, Ordering::SeqCst);
        }));
        let core = RequestCore::new(echo_after_ms(), options);

        let call = core.run_async(Some(erase(100u64)));
        core.cancel();
        assert!(!core.state().loading.get());

        assert!(matches!(call.await, Ok(None)));
        assert_eq!(data_of(&core), None);
        assert!(!core.state().loading.get());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_sets_error_and_calls_back() {
        let service = BoxCloneSyncService::new(service_fn(|_: AnyValue| async {
            Err::<AnyValue, BoxError>("boom".into())
        }));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let mut options = RequestOptions::new();
        options.on_error = Some(Arc::new(move |err: &RequestError, _: &AnyValue| {
            *seen2.lock() = Some(err.to_string());
        }));
        let core = RequestCore::new(service, options);

        let err = core.run_async(Some(erase(()))).await.unwrap_err();
        assert_eq!(err.to_string(), "service failed: boom");
        assert!(core.state().error.get().is_some());
        assert_eq!(seen.lock().as_deref(), Some("service failed: boom"));
    }

    #[tokio::test]
    async fn test_success_clears_error_and_may_replace_value() {
        let mut options = RequestOptions::new();
        options.on_success = Some(Arc::new(|v: &AnyValue, _: &AnyValue| {
            downcast::<u64>(v).map(|n| erase(n * 2))
        }));
        let core = RequestCore::new(echo_after_ms(), options);
        core.state().error.set(Some(RequestError::Dropped));

        core.run_async(Some(erase(0u64))).await.unwrap();
        assert_eq!(data_of(&core), Some(0));
        assert!(core.state().error.get().is_none());

        core.run_async(Some(erase(21u64))).await.unwrap();
        assert_eq!(data_of(&core), Some(42));
    }

    #[test]
    fn test_mutate_does_not_call_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let service = BoxCloneSyncService::new(service_fn(move |p: AnyValue| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(p) }
        }));
        let core = RequestCore::new(service, RequestOptions::new());

        core.mutate(erase(5u64));
        assert_eq!(data_of(&core), Some(5));
        core.mutate_with(|prev| {
            let prev = prev.as_ref().and_then(downcast::<u64>).unwrap_or(0);
            erase(prev + 1)
        });
        assert_eq!(data_of(&core), Some(6));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_tick_waits_for_finally() {
        let core = RequestCore::new(echo_after_ms(), RequestOptions::new());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let idle = core.request_tick(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        idle.await;

        core.run(Some(erase(500u64)));
        let fired3 = Arc::clone(&fired);
        let tick = core.request_tick(move || {
            fired3.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tick.await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(data_of(&core), Some(500));
        assert_eq!(core.state().status.get(), Status::Settled);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_service_and_finally() {
        let finally = Arc::new(AtomicUsize::new(0));
        let finally2 = Arc::clone(&finally);
        let gate = plugin_fn("gate", move |_| {
            let finally = Arc::clone(&finally2);
            Ok(Box::new(
                HookMap::new()
                    .on_before(|_| BeforeOutcome::short_circuit(Some(erase(7u64))))
                    .on_finally(move |_| {
                        finally.fetch_add(1, Ordering::SeqCst);
                    }),
            ))
        });
        let core = RequestCore::with_plugins(
            echo_after_ms(),
            RequestOptions::new(),
            &[gate],
            &Services::default(),
        )
        .unwrap();

        let out = core.run_async(Some(erase(1u64))).await.unwrap();
        assert_eq!(out.as_ref().and_then(downcast::<u64>), Some(7));
        assert_eq!(data_of(&core), Some(7));
        assert_eq!(core.state().status.get(), Status::Settled);
        assert!(!core.state().loading.get());
        assert_eq!(finally.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_plugin_aborts_construction() {
        let broken = plugin_fn("broken", |_| Err("no config".into()));
        let err = RequestCore::with_plugins(
            echo_after_ms(),
            RequestOptions::new(),
            &[broken],
            &Services::default(),
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::PluginInit { ref plugin, .. } if plugin == "broken"));
    }

    #[tokio::test]
    async fn test_no_params_calls_service_with_unit() {
        let core = RequestCore::new(echo_after_ms(), RequestOptions::new());
        let out = core.run_async(None).await.unwrap();
        assert!(out.as_ref().and_then(downcast::<()>).is_some());
        assert!(core.state().params.get().as_ref().and_then(downcast::<()>).is_some());
        assert!(!core.state().loading.get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_default_recomputed() {
        let counter = Arc::new(AtomicU64::new(0));
        let counter2 = Arc::clone(&counter);
        let mut options = RequestOptions::new();
        options.default_params = Some(ParamsSource::Producer(Arc::new(move || {
            erase(counter2.fetch_add(1, Ordering::SeqCst) + 10)
        })));
        let core = RequestCore::new(echo_after_ms(), options);

        core.run_async(None).await.unwrap();
        core.run_async(None).await.unwrap();
        assert_eq!(data_of(&core), Some(12));
    }

    #[tokio::test]
    async fn test_dispose_runs_teardown_once() {
        let core = RequestCore::new(echo_after_ms(), RequestOptions::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        core.on_dispose(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        core.dispose();
        core.dispose();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!core.handle().is_alive());
        assert!(matches!(
            core.run_async(Some(erase(0u64))).await,
            Err(RequestError::Disposed)
        ));
    }
}
