//! Host lifecycle scopes.
//!
//! A scope stands in for a host component: it layers its own ambient
//! options over the runtime's, and disposing it tears down every instance
//! it created. Child scopes inherit their parent's options.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use volley_core::{
    BoxError, ErasedService, Options, PluginFactory, Request, RequestCore, RequestOptions,
    erase_service,
};

use crate::error::RuntimeResult;
use crate::runtime::VolleyRuntime;

/// Owns the instances created through it; closes on drop.
pub struct RequestScope {
    runtime: VolleyRuntime,
    /// Overrides layered over the runtime's ambient options.
    options: RequestOptions,
    owned: Mutex<Vec<RequestCore>>,
}

impl RequestScope {
    pub(crate) fn new(runtime: VolleyRuntime) -> Self {
        Self::with_options(runtime, RequestOptions::new())
    }

    fn with_options(runtime: VolleyRuntime, options: RequestOptions) -> Self {
        Self {
            runtime,
            options,
            owned: Mutex::new(Vec::new()),
        }
    }

    /// Opens a nested scope whose options override this one's.
    pub fn child(&self, options: RequestOptions) -> RequestScope {
        Self::with_options(
            self.runtime.clone(),
            RequestOptions::merge(&self.options, &options),
        )
    }

    pub fn runtime(&self) -> &VolleyRuntime {
        &self.runtime
    }

    /// Options this scope adds over the runtime's ambient options.
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Effective ambient options for instances created here.
    pub fn config(&self) -> RequestOptions {
        RequestOptions::merge(&self.runtime.global_config(), &self.options)
    }

    /// Like [`VolleyRuntime::use_request`], with the instance bound to this
    /// scope's lifetime.
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

    pub fn use_request_raw(
        &self,
        service: ErasedService,
        options: RequestOptions,
        plugins: &[Arc<dyn PluginFactory>],
    ) -> RuntimeResult<RequestCore> {
        let options = RequestOptions::merge(&self.config(), &options);
        let core = self.runtime.build(service, options, plugins)?;
        self.owned.lock().push(core.clone());
        Ok(core)
    }

    /// Number of live instances owned by this scope.
    pub fn len(&self) -> usize {
        self.owned.lock().iter().filter(|c| !c.is_disposed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every owned instance. Idempotent.
    pub fn close(&self) {
        let owned = std::mem::take(&mut *self.owned.lock());
        if owned.is_empty() {
            return;
        }
        debug!(requests = owned.len(), "Closing request scope");
        for core in owned {
            core.dispose();
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("options", &self.options)
            .field("owned", &self.owned.lock().len())
            .finish()
    }
}
