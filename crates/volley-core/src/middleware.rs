//! Construction middleware.
//!
//! Plugins observe one instance's executions; middleware wraps the
//! construction of instances. A middleware receives the next
//! [`BuildFn`] and returns a new one, so it can rewrite the service, the
//! options or the plugin list before delegating, and inspect the built
//! instance afterwards.
//!
//! The list is composed as an onion: the first middleware is outermost, so
//! it enters first and exits last.
//!
//! ```text
//! first ─┐
//!        second ─┐
//!                build
//!        second ◄┘
//! first ◄┘
//! ```

use std::fmt;
use std::sync::Arc;

use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::engine::{ErasedService, RequestCore};
use crate::error::{BoxError, BuildResult};
use crate::options::RequestOptions;
use crate::plugin::PluginFactory;
use crate::value::AnyValue;

/// Instance construction: `(service, options, plugins) -> instance`.
pub type BuildFn = Arc<
    dyn Fn(ErasedService, RequestOptions, Vec<Arc<dyn PluginFactory>>) -> BuildResult<RequestCore>
        + Send
        + Sync,
>;

/// Wraps instance construction.
pub trait Middleware: Send + Sync {
    /// Unique name; later registrations of the same name replace earlier
    /// ones.
    fn name(&self) -> &str;

    /// Returns `next` wrapped by this middleware.
    fn wrap(&self, next: BuildFn) -> BuildFn;
}

struct FnMiddleware<F> {
    name: String,
    wrap: F,
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(BuildFn) -> BuildFn + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, next: BuildFn) -> BuildFn {
        (self.wrap)(next)
    }
}

/// Creates a middleware from a closure.
pub fn middleware_fn<F>(name: impl Into<String>, wrap: F) -> Arc<dyn Middleware>
where
    F: Fn(BuildFn) -> BuildFn + Send + Sync + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        wrap,
    })
}

/// Applies a tower [`Layer`] to every service passing through.
///
/// ```rust,ignore
/// let timeout = LayerMiddleware::new("timeout", TimeoutLayer::new(Duration::from_secs(5)));
/// ```
#[derive(Clone)]
pub struct LayerMiddleware<L> {
    name: String,
    layer: L,
}

impl<L> LayerMiddleware<L> {
    pub fn new(name: impl Into<String>, layer: L) -> Self {
        Self {
            name: name.into(),
            layer,
        }
    }
}

impl<L> Middleware for LayerMiddleware<L>
where
    L: Layer<ErasedService> + Clone + Send + Sync + 'static,
    L::Service: Service<AnyValue, Response = AnyValue, Error = BoxError> + Clone + Send + Sync + 'static,
    <L::Service as Service<AnyValue>>::Future: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, next: BuildFn) -> BuildFn {
        let layer = self.layer.clone();
        Arc::new(
            move |service: ErasedService,
                  options: RequestOptions,
                  plugins: Vec<Arc<dyn PluginFactory>>| {
                let layered = BoxCloneSyncService::new(layer.layer(service));
                next(layered, options, plugins)
            },
        )
    }
}

impl<L> fmt::Debug for LayerMiddleware<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerMiddleware")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Concatenates `global` then `local`, de-duplicated by name.
///
/// A later middleware replaces an earlier one of the same name in place.
pub fn merge_middleware(
    global: &[Arc<dyn Middleware>],
    local: &[Arc<dyn Middleware>],
) -> Vec<Arc<dyn Middleware>> {
    let mut merged: Vec<Arc<dyn Middleware>> = Vec::with_capacity(global.len() + local.len());
    for m in global.iter().chain(local) {
        match merged.iter().position(|e| e.name() == m.name()) {
            Some(idx) => merged[idx] = Arc::clone(m),
            None => merged.push(Arc::clone(m)),
        }
    }
    merged
}

/// Composes `middleware` around `core`; the first entry is outermost.
pub fn compose(middleware: &[Arc<dyn Middleware>], core: BuildFn) -> BuildFn {
    middleware.iter().rev().fold(core, |next, m| m.wrap(next))
}
