//! Request configuration.
//!
//! [`RequestOptions`] is the erased configuration value every plugin
//! constructor receives. Every recognized key is optional so that ambient
//! (runtime or scope level) options and per-call options shallow-merge with
//! [`RequestOptions::merge`]. Keys the core does not recognize travel in
//! [`RequestOptions::extra`] untouched.
//!
//! Most callers use the typed [`Options`](crate::Options) builder instead of
//! filling this struct by hand.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{CacheBackend, Ttl};
use crate::cell::{Cell, Observable};
use crate::error::RequestError;
use crate::middleware::{Middleware, merge_middleware};
use crate::value::AnyValue;

/// User `on_before` callback.
pub type OnBefore = Arc<dyn Fn(&AnyValue) + Send + Sync>;
/// User `on_success` callback; a returned value replaces the result.
pub type OnSuccess = Arc<dyn Fn(&AnyValue, &AnyValue) -> Option<AnyValue> + Send + Sync>;
/// User `on_error` callback.
pub type OnError = Arc<dyn Fn(&RequestError, &AnyValue) + Send + Sync>;
/// User `on_finally` callback.
pub type OnFinally = Arc<dyn Fn(&AnyValue) + Send + Sync>;
/// User `on_cancel` callback.
pub type OnCancel = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// Option value types
// =============================================================================

/// Where default params come from.
#[derive(Clone)]
pub enum ParamsSource {
    /// A fixed value.
    Value(AnyValue),
    /// Recomputed on every run that is invoked without params.
    Producer(Arc<dyn Fn() -> AnyValue + Send + Sync>),
}

impl ParamsSource {
    pub fn resolve(&self) -> AnyValue {
        match self {
            Self::Value(v) => Arc::clone(v),
            Self::Producer(f) => f(),
        }
    }

    pub fn is_producer(&self) -> bool {
        matches!(self, Self::Producer(_))
    }
}

/// Readiness gate.
#[derive(Clone)]
pub enum Ready {
    Value(bool),
    Fn(Arc<dyn Fn() -> bool + Send + Sync>),
    /// A reactive flag; flipping it to `true` also triggers a run.
    Cell(Cell<bool>),
}

impl Ready {
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Value(v) => *v,
            Self::Fn(f) => f(),
            Self::Cell(c) => c.get(),
        }
    }
}

/// Cache key, fixed or derived from params.
#[derive(Clone)]
pub enum CacheKey {
    Static(String),
    Dynamic(Arc<dyn Fn(Option<&AnyValue>) -> String + Send + Sync>),
}

impl CacheKey {
    pub fn resolve(&self, params: Option<&AnyValue>) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Dynamic(f) => f(params),
        }
    }

    /// Returns the key if it does not depend on params.
    pub fn as_static(&self) -> Option<&str> {
        match self {
            Self::Static(key) => Some(key),
            Self::Dynamic(_) => None,
        }
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::Static(key.to_owned())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::Static(key)
    }
}

/// How many times a failed call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCount {
    Times(u32),
    Infinite,
}

impl RetryCount {
    /// Converts a count where `-1` means retry forever.
    pub fn from_count(count: i64) -> Self {
        if count < 0 {
            Self::Infinite
        } else {
            Self::Times(u32::try_from(count).unwrap_or(u32::MAX))
        }
    }

    /// Returns `true` if another retry is allowed after `done` retries.
    pub fn allows(self, done: u32) -> bool {
        match self {
            Self::Infinite => true,
            Self::Times(n) => done < n,
        }
    }
}

/// Debounce edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
    pub leading: bool,
    pub trailing: bool,
    pub max_wait: Option<Duration>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }
}

/// Throttle edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    pub leading: bool,
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

// =============================================================================
// RequestOptions
// =============================================================================

/// Erased request configuration.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Do not run automatically on creation.
    pub manual: Option<bool>,
    /// Registers the instance for lookup by id.
    pub id: Option<String>,
    pub default_params: Option<ParamsSource>,
    pub default_data: Option<AnyValue>,

    pub on_before: Option<OnBefore>,
    pub on_success: Option<OnSuccess>,
    pub on_error: Option<OnError>,
    pub on_finally: Option<OnFinally>,
    pub on_cancel: Option<OnCancel>,

    pub ready: Option<Ready>,

    pub cache_key: Option<CacheKey>,
    pub cache_time: Option<Ttl>,
    pub stale_time: Option<Ttl>,
    /// Replaces the runtime's cache store for this request.
    pub cache_store: Option<Arc<dyn CacheBackend>>,

    pub loading_delay: Option<Duration>,

    pub polling_interval: Option<Duration>,
    /// Consecutive polling failures tolerated; `None` means unlimited.
    pub polling_error_retry_count: Option<u32>,
    pub polling_when_hidden: Option<bool>,

    pub retry_count: Option<RetryCount>,
    /// Fixed retry delay; exponential backoff when absent.
    pub retry_interval: Option<Duration>,

    pub debounce_wait: Option<Duration>,
    pub debounce_options: Option<DebounceOptions>,
    pub throttle_wait: Option<Duration>,
    pub throttle_options: Option<ThrottleOptions>,

    pub refresh_deps: Vec<Arc<dyn Observable>>,
    pub refresh_deps_params: Option<ParamsSource>,

    pub refresh_on_window_focus: Option<bool>,
    pub cancel_on_window_blur: Option<bool>,
    pub focus_timespan: Option<Duration>,

    /// Construction middleware.
    pub middleware: Vec<Arc<dyn Middleware>>,

    /// Unrecognized keys, forwarded verbatim to every plugin.
    pub extra: Map<String, Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow-merges `over` onto `base`.
    ///
    /// Every key set in `over` wins, and a non-empty dependency list counts
    /// as set. Middleware lists concatenate with `base` first and are
    /// de-duplicated by name. `extra` maps are merged key by key.
    pub fn merge(base: &Self, over: &Self) -> Self {
        let base = base.clone();
        let over = over.clone();

        let refresh_deps = if over.refresh_deps.is_empty() {
            base.refresh_deps
        } else {
            over.refresh_deps
        };

        let mut extra = base.extra;
        extra.extend(over.extra);

        Self {
            manual: over.manual.or(base.manual),
            id: over.id.or(base.id),
            default_params: over.default_params.or(base.default_params),
            default_data: over.default_data.or(base.default_data),
            on_before: over.on_before.or(base.on_before),
            on_success: over.on_success.or(base.on_success),
            on_error: over.on_error.or(base.on_error),
            on_finally: over.on_finally.or(base.on_finally),
            on_cancel: over.on_cancel.or(base.on_cancel),
            ready: over.ready.or(base.ready),
            cache_key: over.cache_key.or(base.cache_key),
            cache_time: over.cache_time.or(base.cache_time),
            stale_time: over.stale_time.or(base.stale_time),
            cache_store: over.cache_store.or(base.cache_store),
            loading_delay: over.loading_delay.or(base.loading_delay),
            polling_interval: over.polling_interval.or(base.polling_interval),
            polling_error_retry_count: over
                .polling_error_retry_count
                .or(base.polling_error_retry_count),
            polling_when_hidden: over.polling_when_hidden.or(base.polling_when_hidden),
            retry_count: over.retry_count.or(base.retry_count),
            retry_interval: over.retry_interval.or(base.retry_interval),
            debounce_wait: over.debounce_wait.or(base.debounce_wait),
            debounce_options: over.debounce_options.or(base.debounce_options),
            throttle_wait: over.throttle_wait.or(base.throttle_wait),
            throttle_options: over.throttle_options.or(base.throttle_options),
            refresh_deps,
            refresh_deps_params: over.refresh_deps_params.or(base.refresh_deps_params),
            refresh_on_window_focus: over
                .refresh_on_window_focus
                .or(base.refresh_on_window_focus),
            cancel_on_window_blur: over.cancel_on_window_blur.or(base.cancel_on_window_blur),
            focus_timespan: over.focus_timespan.or(base.focus_timespan),
            middleware: merge_middleware(&base.middleware, &over.middleware),
            extra,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual.unwrap_or(false)
    }

    /// Looks up an unrecognized key.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Deserializes an unrecognized key into `T`.
    pub fn extra_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extra
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("manual", &self.manual)
            .field("id", &self.id)
            .field("cache_key", &self.cache_key.as_ref().map(|k| k.as_static()))
            .field("cache_time", &self.cache_time)
            .field("stale_time", &self.stale_time)
            .field("loading_delay", &self.loading_delay)
            .field("polling_interval", &self.polling_interval)
            .field("retry_count", &self.retry_count)
            .field("debounce_wait", &self.debounce_wait)
            .field("throttle_wait", &self.throttle_wait)
            .field("refresh_deps", &self.refresh_deps.len())
            .field(
                "middleware",
                &self.middleware.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}
