//! Suppresses `loading` for calls that finish quickly.

use std::time::Duration;

use volley_core::{
    AnyValue, BeforeOutcome, BoxError, HookMap, PluginContext, PluginFactory, RequestHandle,
    RequestHooks, Status,
};

use super::LOADING_DELAY;
use crate::timer::TimerSlot;

/// Holds `loading` at `false` until the call has been pending for
/// `loading_delay`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadingDelayPlugin;

struct LoadingDelayHooks {
    handle: RequestHandle,
    delay: Duration,
    timer: TimerSlot,
}

impl RequestHooks for LoadingDelayHooks {
    fn on_before(&self, _params: &AnyValue) -> BeforeOutcome {
        self.timer.clear();
        self.handle.set_loading(false);

        // The engine bumps the generation before `on_before`.
        let generation = self.handle.generation();
        let handle = self.handle.clone();
        self.timer.arm(self.delay, move || {
            let still_pending = handle.status() == Some(Status::Pending);
            if still_pending && handle.generation() == generation {
                handle.set_loading(true);
            }
        });
        BeforeOutcome::proceed()
    }

    fn on_cancel(&self) {
        self.timer.clear();
    }

    fn on_finally(&self, _params: &AnyValue) {
        self.timer.clear();
    }
}

impl PluginFactory for LoadingDelayPlugin {
    fn name(&self) -> &str {
        LOADING_DELAY
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        match ctx.options().loading_delay {
            Some(delay) if !delay.is_zero() => Ok(Box::new(LoadingDelayHooks {
                handle: ctx.handle().clone(),
                delay,
                timer: TimerSlot::new(),
            })),
            _ => Ok(Box::new(HookMap::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use volley_core::{RequestOptions, Services, erase};

    use super::*;
    use crate::plugin::testing::{build, counting_echo};

    fn delayed(ms: u64) -> RequestOptions {
        RequestOptions {
            loading_delay: Some(Duration::from_millis(ms)),
            ..RequestOptions::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_never_shows_loading() {
        let (service, _) = counting_echo(Duration::from_millis(100));
        let core = build(service, delayed(300), Arc::new(LoadingDelayPlugin), &Services::new());

        let pending = core.run_async(Some(erase(1u32)));
        assert!(!core.state().loading.get());
        pending.await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!core.state().loading.get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_shows_loading_after_delay() {
        let (service, _) = counting_echo(Duration::from_millis(1_000));
        let core = build(service, delayed(300), Arc::new(LoadingDelayPlugin), &Services::new());

        let pending = tokio::spawn(core.run_async(Some(erase(1u32))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!core.state().loading.get());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(core.state().loading.get());

        pending.await.unwrap().unwrap();
        assert!(!core.state().loading.get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_timer() {
        let (service, _) = counting_echo(Duration::from_millis(1_000));
        let core = build(service, delayed(300), Arc::new(LoadingDelayPlugin), &Services::new());

        drop(tokio::spawn(core.run_async(Some(erase(1u32)))));
        core.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!core.state().loading.get());
    }
}
