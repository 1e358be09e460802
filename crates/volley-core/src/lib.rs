//! # Volley Core
//!
//! The execution engine of the Volley request orchestration framework.
//!
//! Given an opaque asynchronous service and a declarative configuration, a
//! request instance tracks in-flight state (`loading`, `data`, `error`,
//! `status`), exposes imperative controls (run, cancel, refresh, mutate) and
//! lets an open set of plugins compose around each execution without the
//! engine knowing about any of them.
//!
//! ## Layers
//!
//! Leaves first:
//!
//! - **Reactive cell**: observable single-value state ([`Cell`]).
//! - **Cache subsystem**: TTL store ([`CacheStore`]), in-flight call
//!   registry ([`PromiseRegistry`]) and cross-instance bus ([`CacheBus`]).
//! - **Hook protocol**: the extension contract ([`RequestHooks`]) and the
//!   `on_before` merge rules ([`BeforeOutcome`]).
//! - **Plugin registry**: priority-sorted, de-duplicated plugin list
//!   ([`PluginRegistry`]).
//! - **Execution engine**: [`RequestCore`] with generation-counted race
//!   resolution and tick synchronization.
//! - **Middleware chain**: onion-composed wrappers around instance
//!   construction ([`Middleware`]).
//!
//! ## Execution flow
//!
//! ```text
//! run_async(params)
//!     │
//!     ├─ loading = true, params adopted, status = pending, generation += 1
//!     ├─ on_before (merged) ──── return_now ───▶ settled, resolve(return_data)
//!     ├─ user on_before
//!     ├─ on_init (composed around the service call)
//!     ├─ await
//!     ├─ stale generation? ──────────────────▶ resolve(None)
//!     ├─ on_success / on_error
//!     └─ loading = false, status = settled, tick released, on_finally
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use volley_core::{RequestCore, Request, Options, erase_service, BoxError};
//!
//! async fn fetch_user(id: u64) -> Result<String, BoxError> {
//!     Ok(format!("user-{id}"))
//! }
//!
//! let options = Options::<String, u64>::new().default_params(1);
//! let request = Request::<String, u64>::from_core(RequestCore::new(
//!     erase_service(fetch_user),
//!     options.into_raw(),
//! ));
//!
//! let user = request.run_async(7).await?;
//! ```

pub mod cache;
pub mod cell;
pub mod engine;
pub mod error;
pub mod hook;
pub mod middleware;
pub mod options;
pub mod plugin;
pub mod request;
pub mod value;

pub use futures::future::BoxFuture;

pub use cache::{
    CacheBackend, CacheBus, CacheEntry, CacheStore, DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME,
    PromiseRegistry, SharedCall, Ttl,
};
pub use cell::{Cell, Observable, Subscription};
pub use engine::{ErasedService, RequestCore, RequestHandle, RequestState, Status};
pub use error::{BoxError, BuildError, BuildResult, RequestError, RequestResult, SharedError};
pub use hook::{BeforeOutcome, HookChain, HookMap, RequestHooks, RunFn, ServiceCall};
pub use middleware::{BuildFn, LayerMiddleware, Middleware, compose, merge_middleware, middleware_fn};
pub use options::{
    CacheKey, DebounceOptions, OnBefore, OnCancel, OnError, OnFinally, OnSuccess, ParamsSource,
    Ready, RequestOptions, RetryCount, ThrottleOptions,
};
pub use plugin::{PRIORITY_STEP, PluginContext, PluginFactory, PluginRegistry, Services, plugin_fn};
pub use request::{Options, Request, erase_service};
pub use value::{AnyValue, downcast, erase};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        AnyValue, BeforeOutcome, BoxError, Cell, HookMap, Options, PluginContext, PluginFactory,
        Request, RequestError, RequestHandle, RequestHooks, RequestOptions, RequestResult,
        RetryCount, Status, Ttl, downcast, erase, plugin_fn,
    };
}
