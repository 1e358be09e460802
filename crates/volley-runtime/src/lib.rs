//! Volley Runtime - the host-facing layer of the Volley request framework.
//!
//! This crate provides:
//! - [`VolleyRuntime`]: owner of the shared cache, in-flight registry, cache
//!   bus, visibility bus, plugin registry and request-id map; the instance
//!   factory
//! - [`RequestScope`]: host lifecycle scopes with nested ambient options
//! - Layered configuration (`volley.toml`, `VOLLEY_*` env vars)
//! - Logging setup on `tracing-subscriber`
//!
//! ```rust,ignore
//! use volley_runtime::{VolleyRuntime, config::load_config};
//!
//! let config = load_config()?;
//! let runtime = VolleyRuntime::from_config(&config);
//!
//! let scope = runtime.scope();
//! let user = scope.use_request(fetch_user, Options::new().default_params(7), &[])?;
//! // dropping `scope` disposes `user`
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod scope;

pub use config::{ConfigError, ConfigLoader, ConfigResult, RequestDefaults, VolleyConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use registry::RequestMap;
pub use runtime::VolleyRuntime;
pub use scope::RequestScope;

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for convenient imports.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
