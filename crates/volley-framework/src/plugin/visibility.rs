//! Reacts to host focus changes.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};
use volley_core::{BoxError, HookMap, PluginContext, PluginFactory, RequestHooks};

use super::VISIBILITY;
use crate::visibility::{Visibility, VisibilityBus};

/// Default minimum spacing between focus-triggered refreshes.
pub const DEFAULT_FOCUS_TIMESPAN: Duration = Duration::from_secs(5);

/// Refreshes on focus (at most once per `focus_timespan`) and cancels on
/// blur, as configured.
///
/// Needs a [`VisibilityBus`] among the runtime's services.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisibilityPlugin;

impl PluginFactory for VisibilityPlugin {
    fn name(&self) -> &str {
        VISIBILITY
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        let refresh_on_focus = options.refresh_on_window_focus.unwrap_or(false);
        let cancel_on_blur = options.cancel_on_window_blur.unwrap_or(false);
        if !refresh_on_focus && !cancel_on_blur {
            return Ok(Box::new(HookMap::new()));
        }
        let Some(bus) = ctx.service::<VisibilityBus>() else {
            warn!(request = ctx.handle().id(), "Focus options set but no visibility bus registered");
            return Ok(Box::new(HookMap::new()));
        };

        let timespan = options.focus_timespan.unwrap_or(DEFAULT_FOCUS_TIMESPAN);
        let last_refresh: Mutex<Option<Instant>> = Mutex::new(None);
        let handle = ctx.handle().clone();

        let sub = bus.subscribe(move |visibility| match visibility {
            Visibility::Visible if refresh_on_focus => {
                let now = Instant::now();
                {
                    let mut last = last_refresh.lock();
                    if last.is_some_and(|at| now.saturating_duration_since(at) < timespan) {
                        return;
                    }
                    *last = Some(now);
                }
                trace!(request = handle.id(), "Refreshing on focus");
                handle.refresh();
            }
            Visibility::Hidden if cancel_on_blur => handle.cancel(),
            _ => {}
        });
        ctx.handle().on_dispose(move || drop(sub));

        Ok(Box::new(HookMap::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use volley_core::{RequestOptions, Services, erase};

    use super::*;
    use crate::plugin::testing::{build, calls, counting_echo};

    fn focus_options() -> RequestOptions {
        RequestOptions {
            refresh_on_window_focus: Some(true),
            cancel_on_window_blur: Some(true),
            focus_timespan: Some(Duration::from_millis(1_000)),
            ..RequestOptions::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_refresh_is_rate_limited() {
        let (service, counter) = counting_echo(Duration::ZERO);
        let bus = VisibilityBus::new();
        let services = Services::new().with(bus.clone());
        let core = build(service, focus_options(), Arc::new(VisibilityPlugin), &services);
        core.run_async(Some(erase(1u32))).await.unwrap();

        bus.set_visible(false);
        bus.set_visible(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 2);

        bus.set_visible(false);
        bus.set_visible(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 2);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        bus.set_visible(false);
        bus.set_visible(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&counter), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blur_cancels_in_flight_call() {
        let (service, _) = counting_echo(Duration::from_millis(500));
        let bus = VisibilityBus::new();
        let services = Services::new().with(bus.clone());
        let core = build(service, focus_options(), Arc::new(VisibilityPlugin), &services);

        let pending = core.run_async(Some(erase(1u32)));
        bus.set_visible(false);

        assert!(pending.await.unwrap().is_none());
        assert!(core.state().data.get().is_none());

        core.dispose();
        assert_eq!(bus.listener_count(), 0);
    }
}
