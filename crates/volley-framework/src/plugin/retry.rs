//! Retries failed calls with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use volley_core::{
    AnyValue, BeforeOutcome, BoxError, HookMap, PluginContext, PluginFactory, RequestError,
    RequestHandle, RequestHooks, RetryCount,
};

use super::RETRY;
use crate::timer::TimerSlot;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Backoff before retry number `attempt` (1-based): `min(1s * 2^attempt, 30s)`.
pub fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(BACKOFF_CAP, |d| d.min(BACKOFF_CAP))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPlugin;

#[derive(Default)]
struct Attempts {
    failed: u32,
    /// The next `on_before` belongs to a retry, not a fresh call.
    retrying: bool,
}

struct RetryHooks {
    handle: RequestHandle,
    count: RetryCount,
    interval: Option<Duration>,
    attempts: Arc<Mutex<Attempts>>,
    timer: TimerSlot,
}

impl RequestHooks for RetryHooks {
    fn on_before(&self, _params: &AnyValue) -> BeforeOutcome {
        {
            let mut attempts = self.attempts.lock();
            if !std::mem::take(&mut attempts.retrying) {
                attempts.failed = 0;
            }
        }
        self.timer.clear();
        BeforeOutcome::proceed()
    }

    fn on_success(&self, _data: &AnyValue, _params: &AnyValue) {
        self.attempts.lock().failed = 0;
    }

    fn on_error(&self, _error: &RequestError, _params: &AnyValue) {
        let failed = {
            let mut attempts = self.attempts.lock();
            attempts.failed += 1;
            attempts.failed
        };
        if !self.count.allows(failed - 1) {
            debug!(request = self.handle.id(), failed, "Retries exhausted");
            self.attempts.lock().failed = 0;
            return;
        }

        let delay = self.interval.unwrap_or_else(|| backoff(failed));
        debug!(request = self.handle.id(), attempt = failed, ?delay, "Scheduling retry");
        let attempts = Arc::clone(&self.attempts);
        let handle = self.handle.clone();
        self.timer.arm(delay, move || {
            attempts.lock().retrying = true;
            handle.refresh();
        });
    }

    fn on_cancel(&self) {
        *self.attempts.lock() = Attempts::default();
        self.timer.clear();
    }
}

impl PluginFactory for RetryPlugin {
    fn name(&self) -> &str {
        RETRY
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        let options = ctx.options();
        match options.retry_count {
            None | Some(RetryCount::Times(0)) => Ok(Box::new(HookMap::new())),
            Some(count) => Ok(Box::new(RetryHooks {
                handle: ctx.handle().clone(),
                count,
                interval: options.retry_interval,
                attempts: Arc::new(Mutex::new(Attempts::default())),
                timer: TimerSlot::new(),
            })),
        }
    }
}
