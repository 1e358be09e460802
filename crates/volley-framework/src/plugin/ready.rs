//! Gates execution on a readiness predicate.

use volley_core::{
    AnyValue, BeforeOutcome, BoxError, HookMap, PluginContext, PluginFactory, Ready, RequestHandle,
    RequestHooks,
};

use super::READY;

/// Skips every call while `ready` is false.
///
/// With an observable [`Ready::Cell`] on a non-manual instance, the switch
/// to `true` also triggers a run with the default params.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyPlugin;

struct ReadyHooks {
    ready: Ready,
    handle: RequestHandle,
}

impl RequestHooks for ReadyHooks {
    fn on_before(&self, _params: &AnyValue) -> BeforeOutcome {
        if self.ready.is_ready() {
            return BeforeOutcome::proceed();
        }
        self.handle.set_loading(false);
        BeforeOutcome::short_circuit(None)
    }
}

impl PluginFactory for ReadyPlugin {
    fn name(&self) -> &str {
        READY
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let Some(ready) = ctx.options().ready.clone() else {
            return Ok(Box::new(HookMap::new()));
        };
        let handle = ctx.handle().clone();

        if let Ready::Cell(cell) = &ready {
            if !ctx.options().is_manual() {
                let trigger = handle.clone();
                let sub = cell.watch(move |ready, _| {
                    if *ready {
                        trigger.run(None);
                    }
                });
                handle.on_dispose(move || drop(sub));
            }
        }

        Ok(Box::new(ReadyHooks { ready, handle }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use volley_core::{Cell, RequestOptions, Services, Status, erase};

    use super::*;
    use crate::plugin::testing::{build, calls, counting_echo, data_u32};

    #[tokio::test]
    async fn test_not_ready_skips_service() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let options = RequestOptions {
            ready: Some(Ready::Value(false)),
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(ReadyPlugin), &Services::new());

        let out = core.run_async(Some(erase(1u32))).await.unwrap();
        assert!(out.is_none());
        assert_eq!(calls(&counter), 0);
        assert!(!core.state().loading.get());
        assert_eq!(core.state().status.get(), Status::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cell_turning_ready_runs_once() {
        let (service, counter) = counting_echo(Duration::from_millis(10));
        let ready = Cell::new(false);
        let options = RequestOptions {
            ready: Some(Ready::Cell(ready.clone())),
            default_params: Some(volley_core::ParamsSource::Value(erase(5u32))),
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(ReadyPlugin), &Services::new());

        ready.set(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls(&counter), 1);
        assert_eq!(data_u32(&core), Some(5));

        ready.set(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls(&counter), 1);

        core.dispose();
        assert_eq!(ready.subscriber_count(), 0);
    }
}
