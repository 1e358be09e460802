//! Timers shared by the built-in plugins.
//!
//! - [`TimerSlot`]: one re-armable delayed callback (polling, retry,
//!   loading delay).
//! - [`Debouncer`]: leading/trailing/max-wait rate limiting of an entry
//!   point (debounce, throttle).
//!
//! Every timer runs on the ambient Tokio runtime and is aborted when its
//! owner drops.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep};
use tracing::{trace, warn};

use volley_core::{AnyValue, DebounceOptions, RequestResult, RunFn, ThrottleOptions};

/// Runs `f` after `delay` on the current runtime.
///
/// Returns `None`, dropping `f`, when called outside a runtime.
pub fn spawn_after(delay: Duration, f: impl FnOnce() + Send + 'static) -> Option<AbortHandle> {
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(async move {
                sleep(delay).await;
                f();
            });
            Some(task.abort_handle())
        }
        Err(_) => {
            warn!(?delay, "No Tokio runtime; timer dropped");
            None
        }
    }
}

// =============================================================================
// TimerSlot
// =============================================================================

/// A single pending timer. Arming replaces whatever was pending.
#[derive(Debug, Default)]
pub struct TimerSlot {
    pending: Mutex<Option<AbortHandle>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `f` after `delay`, aborting the previous timer.
    pub fn arm(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let next = spawn_after(delay, f);
        if let Some(prev) = std::mem::replace(&mut *self.pending.lock(), next) {
            prev.abort();
        }
    }

    pub fn clear(&self) {
        if let Some(prev) = self.pending.lock().take() {
            prev.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.get_mut().take() {
            timer.abort();
        }
    }
}

// =============================================================================
// Debouncer
// =============================================================================

type Waiter = oneshot::Sender<RequestResult<AnyValue>>;

#[derive(Default)]
struct DebounceState {
    last_call: Option<Instant>,
    last_invoke: Option<Instant>,
    timer: Option<AbortHandle>,
    /// Bumped on every restart so an outdated timer task is a no-op.
    epoch: u64,
    /// `Some` while a call is waiting for the trailing edge.
    last_args: Option<Option<AnyValue>>,
    waiters: Vec<Waiter>,
}

struct Invocation {
    args: Option<AnyValue>,
    waiters: Vec<Waiter>,
}

struct DebounceInner {
    func: RunFn,
    wait: Duration,
    leading: bool,
    trailing: bool,
    max_wait: Option<Duration>,
    state: Mutex<DebounceState>,
}

/// Rate-limits calls to an entry point.
///
/// Every call returns a future that resolves with the result of the next
/// invocation that covers it, or with `Ok(None)` when the call is dropped
/// (no trailing edge, or [`cancel`](Self::cancel)).
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebounceInner>,
}

impl Debouncer {
    pub fn new(func: RunFn, wait: Duration, options: DebounceOptions) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                func,
                wait,
                leading: options.leading,
                trailing: options.trailing,
                max_wait: options.max_wait.map(|max| max.max(wait)),
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    /// A throttle is a debounce whose max wait equals its wait.
    pub fn throttle(func: RunFn, wait: Duration, options: ThrottleOptions) -> Self {
        Self::new(
            func,
            wait,
            DebounceOptions {
                leading: options.leading,
                trailing: options.trailing,
                max_wait: Some(wait),
            },
        )
    }

    pub fn call(&self, args: Option<AnyValue>) -> BoxFuture<'static, RequestResult<AnyValue>> {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let invocation = {
            let mut state = inner.state.lock();
            let invoking = inner.should_invoke(&state, now);
            state.last_args = Some(args);
            state.last_call = Some(now);
            state.waiters.push(tx);

            if invoking && state.timer.is_none() {
                // Leading edge.
                state.last_invoke = Some(now);
                DebounceInner::start_timer(inner, &mut state, inner.wait);
                inner.leading.then(|| take_invocation(&mut state, now))
            } else if invoking && inner.max_wait.is_some() {
                DebounceInner::start_timer(inner, &mut state, inner.wait);
                Some(take_invocation(&mut state, now))
            } else {
                if state.timer.is_none() {
                    DebounceInner::start_timer(inner, &mut state, inner.wait);
                }
                None
            }
        };

        if let Some(invocation) = invocation {
            inner.invoke(invocation);
        }
        async move { rx.await.unwrap_or(Ok(None)) }.boxed()
    }

    /// Drops the pending edge; waiting callers resolve with `Ok(None)`.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        state.last_call = None;
        state.last_invoke = None;
        state.last_args = None;
        state.waiters.clear();
    }

    /// Returns `true` while an edge is scheduled.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("wait", &self.inner.wait)
            .field("leading", &self.inner.leading)
            .field("trailing", &self.inner.trailing)
            .field("max_wait", &self.inner.max_wait)
            .finish()
    }
}

fn take_invocation(state: &mut DebounceState, now: Instant) -> Invocation {
    state.last_invoke = Some(now);
    Invocation {
        args: state.last_args.take().flatten(),
        waiters: std::mem::take(&mut state.waiters),
    }
}

impl DebounceInner {
    fn should_invoke(&self, state: &DebounceState, now: Instant) -> bool {
        let Some(last_call) = state.last_call else {
            return true;
        };
        if now.saturating_duration_since(last_call) >= self.wait {
            return true;
        }
        self.max_wait.is_some_and(|max| {
            state
                .last_invoke
                .is_none_or(|at| now.saturating_duration_since(at) >= max)
        })
    }

    fn remaining_wait(&self, state: &DebounceState, now: Instant) -> Duration {
        let since = |at: Option<Instant>| at.map_or(Duration::MAX, |t| now.saturating_duration_since(t));
        let waiting = self.wait.saturating_sub(since(state.last_call));
        match self.max_wait {
            Some(max) => waiting.min(max.saturating_sub(since(state.last_invoke))),
            None => waiting,
        }
    }

    fn start_timer(this: &Arc<Self>, state: &mut DebounceState, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        let epoch = state.epoch;
        let weak: Weak<Self> = Arc::downgrade(this);
        state.timer = spawn_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                DebounceInner::timer_expired(&inner, epoch);
            }
        });
    }

    fn timer_expired(this: &Arc<Self>, epoch: u64) {
        let invocation = {
            let mut state = this.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.timer = None;
            let now = Instant::now();

            if !this.should_invoke(&state, now) {
                let remaining = this.remaining_wait(&state, now);
                DebounceInner::start_timer(this, &mut state, remaining);
                return;
            }
            // Trailing edge.
            if this.trailing && state.last_args.is_some() {
                Some(take_invocation(&mut state, now))
            } else {
                state.last_args = None;
                state.waiters.clear();
                None
            }
        };

        if let Some(invocation) = invocation {
            this.invoke(invocation);
        }
    }

    fn invoke(&self, invocation: Invocation) {
        let Invocation { args, waiters } = invocation;
        trace!(waiters = waiters.len(), "Debounced invocation");
        let call = (self.func)(args);
        let Ok(handle) = Handle::try_current() else {
            warn!("No Tokio runtime; debounced result dropped");
            return;
        };
        handle.spawn(async move {
            let out = call.await;
            for waiter in waiters {
                let _ = waiter.send(out.clone());
            }
        });
    }
}
