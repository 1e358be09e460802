//! # Volley
//!
//! Reactive orchestration of asynchronous requests.
//!
//! Hand Volley an async function and a declarative set of options; it gives
//! back a request instance with observable `data`, `loading`, `error` and
//! `status`, imperative controls (run, refresh, cancel, mutate), and a
//! pipeline of plugins for caching, in-flight de-duplication, polling,
//! retry, debounce, throttle and more.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  use_request  ┌────────────────┐   hooks   ┌────────────────────┐
//! │ VolleyRuntime│──────────────▶│  RequestCore   │◀─────────▶│ ready, cache,      │
//! │ (services,   │  middleware   │ (generation,   │           │ loading-delay,     │
//! │  id map)     │──────────────▶│  state cells)  │           │ polling, retry ... │
//! └──────────────┘               └────────────────┘           └────────────────────┘
//! ```
//!
//! - **volley-core**: the engine, hook protocol, cache subsystem, middleware
//! - **volley-framework**: the built-in plugins and their timers
//! - **volley-runtime**: shared services, scopes, configuration, logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use volley::prelude::*;
//!
//! async fn fetch_user(id: u64) -> Result<String, BoxError> {
//!     Ok(format!("user-{id}"))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let user = volley::use_request(
//!         fetch_user,
//!         Options::new()
//!             .manual(true)
//!             .cache_key("user")
//!             .stale_time(Ttl::For(Duration::from_secs(30))),
//!         &[],
//!     )?;
//!
//!     let name = user.run_async(7).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` (default): load `volley.toml`
//! - `yaml-config`: load `volley.yaml`
//! - `json-log`: JSON log output

use std::future::Future;
use std::sync::Arc;

pub use volley_core as core;
pub use volley_framework as framework;
pub use volley_runtime as runtime;

use volley_core::{BoxError, Options, PluginFactory, Request};
use volley_runtime::{RuntimeResult, VolleyRuntime};

/// Creates a request instance on the process-wide runtime.
///
/// See [`VolleyRuntime::use_request`].
pub fn use_request<R, P, S, F>(
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
    VolleyRuntime::global().use_request(service, options, plugins)
}

/// Looks up an instance registered with an `id` on the process-wide runtime.
pub fn get_request<R, P>(id: &str) -> Option<Request<R, P>>
where
    R: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    VolleyRuntime::global().get_request(id)
}

/// Clears the listed cache keys, or every entry when `keys` is empty.
pub fn clear_cache<K: AsRef<str>>(keys: &[K]) {
    let runtime = VolleyRuntime::global();
    if keys.is_empty() {
        runtime.clear_all_cache();
    } else {
        runtime.clear_cache(keys);
    }
}

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use volley::prelude::*;
/// ```
pub mod prelude {
    pub use std::time::Duration;

    // Runtime - main entry point
    pub use volley_runtime::{RequestScope, RuntimeError, VolleyRuntime};

    // Typed request surface
    pub use volley_core::{
        BoxError, DebounceOptions, Options, Request, RequestError, RequestResult, RetryCount,
        Status, ThrottleOptions, Ttl,
    };

    // Reactive state
    pub use volley_core::{Cell, Observable, Subscription};

    // Extension points
    pub use volley_core::{
        AnyValue, BeforeOutcome, HookMap, Middleware, PluginContext, PluginFactory,
        RequestHooks, middleware_fn, plugin_fn,
    };

    pub use volley_framework::{Visibility, VisibilityBus};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    async fn square(n: u32) -> Result<u32, BoxError> {
        Ok(n * n)
    }

    #[tokio::test]
    async fn test_global_entry_points() {
        let request = crate::use_request(
            square,
            Options::new().manual(true).id("facade-square").cache_key("facade-square"),
            &[],
        )
        .unwrap();

        assert_eq!(request.run_async(4).await.unwrap(), Some(16));
        let found = crate::get_request::<u32, u32>("facade-square").unwrap();
        assert_eq!(found.data(), Some(16));

        assert!(VolleyRuntime::global().cache_store().contains("facade-square"));
        crate::clear_cache::<&str>(&[]);
        assert!(!VolleyRuntime::global().cache_store().contains("facade-square"));

        request.dispose();
        assert!(crate::get_request::<u32, u32>("facade-square").is_none());
    }
}
