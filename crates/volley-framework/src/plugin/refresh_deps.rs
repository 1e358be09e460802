//! Re-runs the request when an observed dependency changes.

use volley_core::{BoxError, HookMap, PluginContext, PluginFactory, RequestHooks, Subscription};

use super::REFRESH_DEPS;

/// Watches `refresh_deps`.
///
/// On change the instance runs with `refresh_deps_params` when configured,
/// otherwise a non-manual instance refreshes. Watching ends on dispose.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshDepsPlugin;

impl PluginFactory for RefreshDepsPlugin {
    fn name(&self) -> &str {
        REFRESH_DEPS
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        if options.refresh_deps.is_empty() {
            return Ok(Box::new(HookMap::new()));
        }

        let manual = options.is_manual();
        let subs: Vec<Subscription> = options
            .refresh_deps
            .iter()
            .map(|dep| {
                let handle = ctx.handle().clone();
                let params = options.refresh_deps_params.clone();
                dep.observe(Box::new(move || match &params {
                    Some(params) => handle.run(Some(params.resolve())),
                    None if !manual => handle.refresh(),
                    None => {}
                }))
            })
            .collect();
        ctx.handle().on_dispose(move || drop(subs));

        Ok(Box::new(HookMap::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use volley_core::{Cell, Observable, ParamsSource, RequestOptions, Services, erase};

    use super::*;
    use crate::plugin::testing::{build, calls, counting_echo, data_u32};

    #[tokio::test(start_paused = true)]
    async fn test_change_refreshes_with_current_params() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let dep = Cell::new(0u8);
        let options = RequestOptions {
            refresh_deps: vec![Arc::new(dep.clone()) as Arc<dyn Observable>],
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(RefreshDepsPlugin), &Services::new());

        core.run_async(Some(erase(4u32))).await.unwrap();
        dep.set(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(calls(&counter), 2);
        assert_eq!(data_u32(&core), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_uses_deps_params_even_when_manual() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let dep = Cell::new(0u8);
        let options = RequestOptions {
            manual: Some(true),
            refresh_deps: vec![Arc::new(dep.clone()) as Arc<dyn Observable>],
            refresh_deps_params: Some(ParamsSource::Value(erase(9u32))),
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(RefreshDepsPlugin), &Services::new());

        dep.set(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 1);
        assert_eq!(data_u32(&core), Some(9));

        core.dispose();
        dep.set(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_value_write_does_not_refresh() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let dep = Cell::new(0u8);
        let options = RequestOptions {
            refresh_deps: vec![Arc::new(dep.clone()) as Arc<dyn Observable>],
            ..RequestOptions::new()
        };
        let core = build(service, options, Arc::new(RefreshDepsPlugin), &Services::new());

        core.run_async(Some(erase(4u32))).await.unwrap();
        dep.set(0);
        dep.set(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 1);

        dep.set(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_without_params_ignores_change() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let dep = Cell::new(0u8);
        let options = RequestOptions {
            manual: Some(true),
            refresh_deps: vec![Arc::new(dep.clone()) as Arc<dyn Observable>],
            ..RequestOptions::new()
        };
        let _core = build(service, options, Arc::new(RefreshDepsPlugin), &Services::new());

        dep.set(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 0);
    }
}
