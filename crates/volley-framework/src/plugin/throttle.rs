//! Throttles the instance's entry point.

use std::time::Duration;

use volley_core::{BoxError, HookMap, PluginContext, PluginFactory, RequestHooks};

use super::THROTTLE;
use super::debounce::RateLimitHooks;
use crate::timer::Debouncer;

/// At most one invocation per `throttle_wait`, leading and trailing by
/// default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottlePlugin;

impl PluginFactory for ThrottlePlugin {
    fn name(&self) -> &str {
        THROTTLE
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        let wait = match options.throttle_wait {
            Some(wait) if wait > Duration::ZERO => wait,
            _ => return Ok(Box::new(HookMap::new())),
        };
        let edges = options.throttle_options.unwrap_or_default();
        Ok(Box::new(RateLimitHooks::new(move |run| {
            Debouncer::throttle(run, wait, edges)
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use volley_core::{RequestOptions, Services, ThrottleOptions, erase};

    use super::*;
    use crate::plugin::testing::{build, calls, counting_echo, data_u32};

    #[tokio::test(start_paused = true)]
    async fn test_leading_then_trailing() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let options = RequestOptions {
            throttle_wait: Some(Duration::from_millis(300)),
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(ThrottlePlugin), &Services::new());

        let first = core.run_async(Some(erase(1u32)));
        drop(tokio::spawn(core.run_async(Some(erase(2u32)))));
        let last = core.run_async(Some(erase(3u32)));

        first.await.unwrap();
        last.await.unwrap();
        assert_eq!(calls(&counter), 2);
        assert_eq!(data_u32(&core), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_disabled_drops_burst() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let options = RequestOptions {
            throttle_wait: Some(Duration::from_millis(300)),
            throttle_options: Some(ThrottleOptions {
                leading: true,
                trailing: false,
            }),
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(ThrottlePlugin), &Services::new());

        let first = core.run_async(Some(erase(1u32)));
        let second = core.run_async(Some(erase(2u32)));

        first.await.unwrap();
        assert!(second.await.unwrap().is_none());
        assert_eq!(calls(&counter), 1);
        assert_eq!(data_u32(&core), Some(1));
    }
}
