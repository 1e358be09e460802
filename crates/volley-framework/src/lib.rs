//! # Volley Framework
//!
//! The built-in plugins of the Volley request orchestration framework.
//!
//! This layer provides:
//! - Readiness gating, caching with stale-while-revalidate and cross-instance
//!   de-duplication
//! - Loading delay, debounce and throttle
//! - Polling, retry with exponential backoff and dependency-driven refresh
//! - Focus and blur reactions via a host-fed [`VisibilityBus`]
//!
//! Plugins only see instances through the hook protocol of `volley-core`;
//! none of them is special-cased by the engine.

pub mod plugin;
pub mod timer;
pub mod visibility;

pub use plugin::{
    BASE_PRIORITIES, CachePlugin, DebouncePlugin, LoadingDelayPlugin, PollingPlugin, ReadyPlugin,
    RefreshDepsPlugin, RetryPlugin, ThrottlePlugin, VisibilityPlugin, base_plugins,
};
pub use timer::{Debouncer, TimerSlot, spawn_after};
pub use visibility::{Visibility, VisibilityBus};
