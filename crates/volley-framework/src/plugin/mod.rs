//! Built-in plugins.
//!
//! Every built-in is a [`PluginFactory`] reading its own option fields and
//! returning a no-op hook set when those fields are absent, so the whole
//! base set can be attached to every instance.
//!
//! | Plugin | Priority | Options |
//! |--------|---------:|---------|
//! | [`ReadyPlugin`] | 10 | `ready` |
//! | [`CachePlugin`] | 20 | `cache_key`, `cache_time`, `stale_time`, `cache_store` |
//! | [`LoadingDelayPlugin`] | 30 | `loading_delay` |
//! | [`DebouncePlugin`] | 40 | `debounce_wait`, `debounce_options` |
//! | [`ThrottlePlugin`] | 50 | `throttle_wait`, `throttle_options` |
//! | [`PollingPlugin`] | 60 | `polling_interval`, `polling_error_retry_count`, `polling_when_hidden` |
//! | [`RetryPlugin`] | 70 | `retry_count`, `retry_interval` |
//! | [`RefreshDepsPlugin`] | 80 | `refresh_deps`, `refresh_deps_params` |
//! | [`VisibilityPlugin`] | 90 | `refresh_on_window_focus`, `cancel_on_window_blur`, `focus_timespan` |
//!
//! Shared state comes from the runtime's [`Services`](volley_core::Services):
//! [`CacheStore`](volley_core::CacheStore),
//! [`PromiseRegistry`](volley_core::PromiseRegistry),
//! [`CacheBus`](volley_core::CacheBus) and
//! [`VisibilityBus`](crate::VisibilityBus).

use std::sync::Arc;

use volley_core::PluginFactory;

mod cache;
mod debounce;
mod loading_delay;
mod polling;
mod ready;
mod refresh_deps;
mod retry;
mod throttle;
mod visibility;

pub use cache::CachePlugin;
pub use debounce::DebouncePlugin;
pub use loading_delay::LoadingDelayPlugin;
pub use polling::PollingPlugin;
pub use ready::ReadyPlugin;
pub use refresh_deps::RefreshDepsPlugin;
pub use retry::RetryPlugin;
pub use throttle::ThrottlePlugin;
pub use visibility::VisibilityPlugin;

pub const READY: &str = "ready";
pub const CACHE: &str = "cache";
pub const LOADING_DELAY: &str = "loading_delay";
pub const DEBOUNCE: &str = "debounce";
pub const THROTTLE: &str = "throttle";
pub const POLLING: &str = "polling";
pub const RETRY: &str = "retry";
pub const REFRESH_DEPS: &str = "refresh_deps";
pub const VISIBILITY: &str = "visibility";

/// Priorities of the base set; lower runs earlier.
pub const BASE_PRIORITIES: [(&str, i32); 9] = [
    (READY, 10),
    (CACHE, 20),
    (LOADING_DELAY, 30),
    (DEBOUNCE, 40),
    (THROTTLE, 50),
    (POLLING, 60),
    (RETRY, 70),
    (REFRESH_DEPS, 80),
    (VISIBILITY, 90),
];

/// The base plugin set, in priority order.
pub fn base_plugins() -> Vec<Arc<dyn PluginFactory>> {
    vec![
        Arc::new(ReadyPlugin),
        Arc::new(CachePlugin),
        Arc::new(LoadingDelayPlugin),
        Arc::new(DebouncePlugin),
        Arc::new(ThrottlePlugin),
        Arc::new(PollingPlugin),
        Arc::new(RetryPlugin),
        Arc::new(RefreshDepsPlugin),
        Arc::new(VisibilityPlugin),
    ]
}
