//! The plugin hook protocol.
//!
//! A plugin observes one request instance through [`RequestHooks`]. Every
//! hook has a no-op default, so a plugin implements only the points it
//! cares about. The engine dispatches each lifecycle point through a
//! [`HookChain`] holding the instance's hooks in ascending priority order.
//!
//! # Lifecycle
//!
//! ```text
//! run_async(params)
//!   ├─ on_before   merged BeforeOutcome; may short-circuit the call
//!   ├─ on_init     each plugin may wrap or substitute the service call
//!   ├─ (await)
//!   ├─ on_success | on_error     current generation only
//!   └─ on_finally                current generation only
//!
//! cancel()  → on_cancel
//! mutate()  → on_mutate
//! ```
//!
//! [`wrap_run`](RequestHooks::wrap_run) is different from the other hooks:
//! it is consulted once, at construction, to decorate the instance's entry
//! point. Debounce and throttle are built on it.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{RequestError, RequestResult};
use crate::value::AnyValue;

/// The pending service call of one execution.
pub type ServiceCall = BoxFuture<'static, Result<AnyValue, RequestError>>;

/// The entry point of an instance: takes optional params, runs one
/// execution.
pub type RunFn =
    Arc<dyn Fn(Option<AnyValue>) -> BoxFuture<'static, RequestResult<AnyValue>> + Send + Sync>;

// =============================================================================
// BeforeOutcome
// =============================================================================

/// What a plugin's `on_before` asks the engine to do.
///
/// Outcomes from every plugin are shallow-merged in priority order: a later
/// `Some` replaces an earlier one, a `None` leaves it untouched.
#[derive(Clone, Default)]
pub struct BeforeOutcome {
    /// `Some(true)` skips the service call entirely.
    pub return_now: Option<bool>,
    /// Written to `data` immediately, and returned when short-circuiting.
    pub return_data: Option<AnyValue>,
}

impl BeforeOutcome {
    /// Lets the call proceed untouched.
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Skips the service call, resolving with `data`.
    pub fn short_circuit(data: Option<AnyValue>) -> Self {
        Self {
            return_now: Some(true),
            return_data: data,
        }
    }

    /// Surfaces `data` immediately while the call proceeds.
    pub fn with_data(data: AnyValue) -> Self {
        Self {
            return_now: None,
            return_data: Some(data),
        }
    }

    /// Merges a later outcome over this one.
    pub fn merge(self, later: Self) -> Self {
        Self {
            return_now: later.return_now.or(self.return_now),
            return_data: later.return_data.or(self.return_data),
        }
    }

    /// Returns `true` if the call must be skipped.
    pub fn is_short_circuit(&self) -> bool {
        self.return_now == Some(true)
    }
}

impl std::fmt::Debug for BeforeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeforeOutcome")
            .field("return_now", &self.return_now)
            .field("has_data", &self.return_data.is_some())
            .finish()
    }
}

// =============================================================================
// RequestHooks
// =============================================================================

/// The seven-point extension contract, plus the construction-time run
/// decorator.
#[allow(unused_variables)]
pub trait RequestHooks: Send + Sync {
    /// Called before the service; may short-circuit or surface data early.
    fn on_before(&self, params: &AnyValue) -> BeforeOutcome {
        BeforeOutcome::proceed()
    }

    /// Wraps or replaces the service call.
    fn on_init(&self, params: &AnyValue, call: ServiceCall) -> ServiceCall {
        call
    }

    /// Called with the accepted value of a current call.
    fn on_success(&self, data: &AnyValue, params: &AnyValue) {}

    /// Called with the failure of a current call.
    fn on_error(&self, error: &RequestError, params: &AnyValue) {}

    /// Called after `on_success` or `on_error` of a current call.
    fn on_finally(&self, params: &AnyValue) {}

    /// Called synchronously by `cancel()`.
    fn on_cancel(&self) {}

    /// Called after `mutate()` overwrote `data`.
    fn on_mutate(&self, data: &AnyValue) {}

    /// Decorates the instance's entry point. Consulted once at construction.
    fn wrap_run(&self, run: RunFn) -> RunFn {
        run
    }
}

// =============================================================================
// HookMap: closure-based partial hooks
// =============================================================================

type ParamsHook = Box<dyn Fn(&AnyValue) + Send + Sync>;

/// A partial hook map assembled from closures.
///
/// Absent hooks are no-ops. Handy for small ad-hoc plugins:
///
/// ```rust,ignore
/// let hooks = HookMap::new().on_finally(|_| println!("done"));
/// ```
#[derive(Default)]
#[allow(clippy::type_complexity)]
pub struct HookMap {
    before: Option<Box<dyn Fn(&AnyValue) -> BeforeOutcome + Send + Sync>>,
    init: Option<Box<dyn Fn(&AnyValue, ServiceCall) -> ServiceCall + Send + Sync>>,
    success: Option<Box<dyn Fn(&AnyValue, &AnyValue) + Send + Sync>>,
    error: Option<Box<dyn Fn(&RequestError, &AnyValue) + Send + Sync>>,
    finally: Option<ParamsHook>,
    cancel: Option<Box<dyn Fn() + Send + Sync>>,
    mutate: Option<ParamsHook>,
}

impl HookMap {
    /// Creates an empty hook map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before(
        mut self,
        f: impl Fn(&AnyValue) -> BeforeOutcome + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(f));
        self
    }

    pub fn on_init(
        mut self,
        f: impl Fn(&AnyValue, ServiceCall) -> ServiceCall + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&AnyValue, &AnyValue) + Send + Sync + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&RequestError, &AnyValue) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_finally(mut self, f: impl Fn(&AnyValue) + Send + Sync + 'static) -> Self {
        self.finally = Some(Box::new(f));
        self
    }

    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancel = Some(Box::new(f));
        self
    }

    pub fn on_mutate(mut self, f: impl Fn(&AnyValue) + Send + Sync + 'static) -> Self {
        self.mutate = Some(Box::new(f));
        self
    }
}

impl RequestHooks for HookMap {
    fn on_before(&self, params: &AnyValue) -> BeforeOutcome {
        self.before
            .as_ref()
            .map_or_else(BeforeOutcome::proceed, |f| f(params))
    }

    fn on_init(&self, params: &AnyValue, call: ServiceCall) -> ServiceCall {
        match &self.init {
            Some(f) => f(params, call),
            None => call,
        }
    }

    fn on_success(&self, data: &AnyValue, params: &AnyValue) {
        if let Some(f) = &self.success {
            f(data, params);
        }
    }

    fn on_error(&self, error: &RequestError, params: &AnyValue) {
        if let Some(f) = &self.error {
            f(error, params);
        }
    }

    fn on_finally(&self, params: &AnyValue) {
        if let Some(f) = &self.finally {
            f(params);
        }
    }

    fn on_cancel(&self) {
        if let Some(f) = &self.cancel {
            f();
        }
    }

    fn on_mutate(&self, data: &AnyValue) {
        if let Some(f) = &self.mutate {
            f(data);
        }
    }
}

// =============================================================================
// HookChain
// =============================================================================

/// An instance's hooks, in ascending priority order.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn RequestHooks>>,
}

impl HookChain {
    pub const fn empty() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn new(hooks: Vec<Box<dyn RequestHooks>>) -> Self {
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every `on_before` in order and merges the outcomes.
    pub fn before(&self, params: &AnyValue) -> BeforeOutcome {
        self.hooks
            .iter()
            .fold(BeforeOutcome::proceed(), |acc, h| acc.merge(h.on_before(params)))
    }

    /// Composes every `on_init`; the first plugin's wrapper is outermost.
    pub fn init(&self, params: &AnyValue, call: ServiceCall) -> ServiceCall {
        self.hooks
            .iter()
            .rev()
            .fold(call, |call, h| h.on_init(params, call))
    }

    pub fn success(&self, data: &AnyValue, params: &AnyValue) {
        for h in &self.hooks {
            h.on_success(data, params);
        }
    }

    pub fn error(&self, error: &RequestError, params: &AnyValue) {
        for h in &self.hooks {
            h.on_error(error, params);
        }
    }

    pub fn finally(&self, params: &AnyValue) {
        for h in &self.hooks {
            h.on_finally(params);
        }
    }

    pub fn cancel(&self) {
        for h in &self.hooks {
            h.on_cancel();
        }
    }

    pub fn mutate(&self, data: &AnyValue) {
        for h in &self.hooks {
            h.on_mutate(data);
        }
    }

    /// Decorates `run` with every plugin's `wrap_run`; the last plugin's
    /// decorator is outermost.
    pub fn wrap_run(&self, run: RunFn) -> RunFn {
        self.hooks.iter().fold(run, |run, h| h.wrap_run(run))
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::value::{downcast, erase};

    #[test]
    fn test_merge_later_some_wins() {
        let merged = BeforeOutcome::with_data(erase(1))
            .merge(BeforeOutcome::short_circuit(None))
            .merge(BeforeOutcome::proceed());

        assert!(merged.is_short_circuit());
        assert_eq!(merged.return_data.as_ref().and_then(downcast::<i32>), Some(1));
    }

    #[test]
    fn test_before_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let log = Arc::clone(&log);
                Box::new(HookMap::new().on_before(move |_| {
                    log.lock().push(name);
                    BeforeOutcome::proceed()
                })) as Box<dyn RequestHooks>
            })
            .collect();

        let chain = HookChain::new(hooks);
        assert!(!chain.before(&erase(())).is_short_circuit());
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_init_first_plugin_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrapper = |name: &'static str| {
            let log = Arc::clone(&log);
            Box::new(HookMap::new().on_init(move |_, call| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(format!("{name} enter"));
                    let out = call.await;
                    log.lock().push(format!("{name} exit"));
                    out
                }
                .boxed()
            })) as Box<dyn RequestHooks>
        };

        let chain = HookChain::new(vec![wrapper("first"), wrapper("second")]);
        let call = chain.init(&erase(()), async { Ok(erase(0)) }.boxed());
        assert!(call.await.is_ok());

        assert_eq!(
            *log.lock(),
            vec!["first enter", "second enter", "second exit", "first exit"]
        );
    }
}
