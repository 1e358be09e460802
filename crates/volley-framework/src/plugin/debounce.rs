//! Debounces the instance's entry point.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use volley_core::{
    AnyValue, BoxError, DebounceOptions, HookMap, PluginContext, PluginFactory, RequestHooks, RunFn,
};

use super::DEBOUNCE;
use crate::timer::Debouncer;

#[derive(Debug, Clone, Copy, Default)]
pub struct DebouncePlugin;

/// Rate-limits `run` through a [`Debouncer`] installed at construction.
///
/// Shared with the throttle plugin, which only differs in its edges.
pub(crate) struct RateLimitHooks {
    make: Box<dyn Fn(RunFn) -> Debouncer + Send + Sync>,
    debouncer: OnceLock<Debouncer>,
}

impl RateLimitHooks {
    pub(crate) fn new(make: impl Fn(RunFn) -> Debouncer + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            debouncer: OnceLock::new(),
        }
    }
}

impl RequestHooks for RateLimitHooks {
    fn wrap_run(&self, run: RunFn) -> RunFn {
        let debouncer = self.debouncer.get_or_init(|| (self.make)(run)).clone();
        Arc::new(move |params: Option<AnyValue>| debouncer.call(params))
    }

    fn on_cancel(&self) {
        if let Some(debouncer) = self.debouncer.get() {
            debouncer.cancel();
        }
    }
}

impl PluginFactory for DebouncePlugin {
    fn name(&self) -> &str {
        DEBOUNCE
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        let wait = match options.debounce_wait {
            Some(wait) if wait > Duration::ZERO => wait,
            _ => return Ok(Box::new(HookMap::new())),
        };
        let edges: DebounceOptions = options.debounce_options.unwrap_or_default();
        Ok(Box::new(RateLimitHooks::new(move |run| {
            Debouncer::new(run, wait, edges)
        })))
    }
}
