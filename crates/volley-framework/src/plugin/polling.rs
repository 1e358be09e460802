//! Re-runs the request on a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, trace};
use volley_core::{
    AnyValue, BeforeOutcome, BoxError, HookMap, PluginContext, PluginFactory, RequestError,
    RequestHandle, RequestHooks,
};

use super::POLLING;
use crate::timer::TimerSlot;
use crate::visibility::VisibilityBus;

/// Schedules a refresh `polling_interval` after every settled call.
///
/// Consecutive failures beyond `polling_error_retry_count` stop polling
/// until the next manual call. With `polling_when_hidden` off, polling
/// pauses while the host is hidden and resumes with a refresh once it is
/// visible again.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingPlugin;

struct PollingState {
    handle: RequestHandle,
    interval: Duration,
    error_limit: Option<u32>,
    errors: AtomicU32,
    /// Set when a tick was skipped because the host was hidden.
    paused: AtomicBool,
    visibility: Option<Arc<VisibilityBus>>,
    timer: TimerSlot,
}

struct PollingHooks {
    state: Arc<PollingState>,
}

impl PollingState {
    fn schedule(&self) {
        if let Some(bus) = &self.visibility {
            if !bus.is_visible() {
                trace!(request = self.handle.id(), "Polling paused while hidden");
                self.paused.store(true, Ordering::Release);
                return;
            }
        }

        let errors = self.errors.load(Ordering::Acquire);
        if self.error_limit.is_some_and(|limit| errors > limit) {
            debug!(request = self.handle.id(), errors, "Polling stopped after repeated failures");
            self.errors.store(0, Ordering::Release);
            return;
        }

        self.handle.increment_polling_count();
        let handle = self.handle.clone();
        self.timer.arm(self.interval, move || handle.refresh());
    }
}

impl RequestHooks for PollingHooks {
    fn on_before(&self, _params: &AnyValue) -> BeforeOutcome {
        self.state.timer.clear();
        BeforeOutcome::proceed()
    }

    fn on_success(&self, _data: &AnyValue, _params: &AnyValue) {
        self.state.errors.store(0, Ordering::Release);
    }

    fn on_error(&self, _error: &RequestError, _params: &AnyValue) {
        self.state.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn on_finally(&self, _params: &AnyValue) {
        self.state.schedule();
    }

    fn on_cancel(&self) {
        self.state.timer.clear();
        self.state.paused.store(false, Ordering::Release);
        self.state.handle.set_polling_count(0);
    }
}

impl PluginFactory for PollingPlugin {
    fn name(&self) -> &str {
        POLLING
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        let interval = match options.polling_interval {
            Some(interval) if !interval.is_zero() => interval,
            _ => return Ok(Box::new(HookMap::new())),
        };
        let when_hidden = options.polling_when_hidden.unwrap_or(true);
        let visibility = if when_hidden {
            None
        } else {
            ctx.service::<VisibilityBus>()
        };

        let state = Arc::new(PollingState {
            handle: ctx.handle().clone(),
            interval,
            error_limit: options.polling_error_retry_count,
            errors: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            visibility: visibility.clone(),
            timer: TimerSlot::new(),
        });

        if let Some(bus) = visibility {
            let weak = Arc::downgrade(&state);
            let sub = bus.subscribe(move |v| {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                if v.is_visible() && state.paused.swap(false, Ordering::AcqRel) {
                    state.handle.refresh();
                }
            });
            ctx.handle().on_dispose(move || drop(sub));
        }

        Ok(Box::new(PollingHooks { state }))
    }
}
