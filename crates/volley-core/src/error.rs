//! Unified error types for the Volley core.
//!
//! [`RequestError`] is what a request resolves with when it fails. It is
//! `Clone` because one failure is observed by several parties at once: the
//! `error` cell, every plugin's `on_error`, the direct awaiter, and any
//! instance sharing the same in-flight call through the cache registry.
//!
//! [`BuildError`] covers instance construction, which fails fast as soon as a
//! plugin factory refuses to build.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by request services.
pub use tower::BoxError;

/// A service error shared between every observer of one failed call.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Request Errors
// =============================================================================

/// Errors a request execution can resolve with.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The service itself failed.
    #[error("service failed: {0}")]
    Service(SharedError),

    /// A value crossing the erased plugin boundary had an unexpected type.
    ///
    /// Typically two instances with different result types share a cache key.
    #[error("type mismatch: expected '{expected}'")]
    TypeMismatch {
        /// Name of the expected type.
        expected: &'static str,
    },

    /// The service takes params, but none were supplied and no default
    /// could be produced.
    #[error("no params available for this request")]
    MissingParams,

    /// The request instance was dropped before the call could start.
    #[error("request instance has been disposed")]
    Disposed,

    /// A shared or deferred call was dropped before it settled.
    #[error("pending call dropped before settling")]
    Dropped,
}

impl RequestError {
    /// Wraps a service error; a boxed `RequestError` is unwrapped as is.
    pub fn service(err: BoxError) -> Self {
        match err.downcast::<RequestError>() {
            Ok(err) => *err,
            Err(err) => Self::Service(Arc::from(err)),
        }
    }

    /// Creates a type mismatch error for `T`.
    pub fn type_mismatch<T: ?Sized>() -> Self {
        Self::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }

    /// Returns the underlying service error, if this is a service failure.
    pub fn as_service(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        match self {
            Self::Service(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Result type of a single request execution.
///
/// `Ok(None)` means the call produced no accepted value: it was superseded,
/// cancelled, or short-circuited without data.
pub type RequestResult<T> = Result<Option<T>, RequestError>;

// =============================================================================
// Build Errors
// =============================================================================

/// Errors raised while constructing a request instance.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A plugin factory failed; the instance is not created.
    #[error("plugin '{plugin}' failed to initialize: {source}")]
    PluginInit {
        /// Name of the failing plugin.
        plugin: String,
        /// Error returned by the factory.
        #[source]
        source: BoxError,
    },
}

/// Result type for instance construction.
pub type BuildResult<T> = Result<T, BuildError>;
