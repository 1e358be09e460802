//! Plugin factories and the priority registry.
//!
//! A plugin is a [`PluginFactory`]: invoked once per request instance with a
//! [`PluginContext`], it returns the instance's [`RequestHooks`]. Factories
//! are identified by [`name`](PluginFactory::name), which is also the key
//! under which their priority is registered.
//!
//! # Ordering
//!
//! The effective plugin list of one instance is
//! `base ∪ global ∪ per-call`, de-duplicated by name (a later source replaces
//! an earlier plugin of the same name but keeps its position) and sorted
//! ascending by priority. Lower priorities run side effects first and
//! contribute first to the `on_before` merge.
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! registry.define(
//!     vec![plugin_fn("audit", |_| Ok(Box::new(HookMap::new())))],
//!     [("audit", 5)],
//! );
//! let ordered = registry.resolve(&[]);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::RequestHandle;
use crate::error::BoxError;
use crate::hook::RequestHooks;
use crate::options::RequestOptions;

/// Priority step between automatically assigned priorities.
pub const PRIORITY_STEP: i32 = 10;

// =============================================================================
// Services
// =============================================================================

/// Shared services made available to plugin factories, keyed by type.
///
/// The runtime inserts its cache store, in-flight registry, cache bus and
/// visibility bus here. A plugin looks them up with [`get`](Self::get).
#[derive(Clone, Default)]
pub struct Services {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`, replacing any previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(service));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    /// Looks up a service by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|s| Arc::clone(s).downcast::<T>().ok())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.map.len())
            .finish()
    }
}

// =============================================================================
// PluginContext
// =============================================================================

/// Everything a plugin factory sees while building hooks for one instance.
pub struct PluginContext<'a> {
    handle: RequestHandle,
    options: &'a RequestOptions,
    services: &'a Services,
}

impl<'a> PluginContext<'a> {
    pub fn new(handle: RequestHandle, options: &'a RequestOptions, services: &'a Services) -> Self {
        Self {
            handle,
            options,
            services,
        }
    }

    /// A weak handle to the instance being built.
    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    /// The fully merged options of the instance.
    pub fn options(&self) -> &'a RequestOptions {
        self.options
    }

    pub fn services(&self) -> &'a Services {
        self.services
    }

    /// Shorthand for `services().get::<T>()`.
    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }
}

impl fmt::Debug for PluginContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("request", &self.handle.id())
            .field("options", self.options)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PluginFactory
// =============================================================================

/// Builds a plugin's hooks for one request instance.
pub trait PluginFactory: Send + Sync {
    /// Unique name; the registry key for de-duplication and priority.
    fn name(&self) -> &str;

    /// Builds the hooks. An error aborts instance construction.
    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError>;
}

type BuildHooks =
    dyn Fn(&PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> + Send + Sync;

struct FnPlugin {
    name: String,
    build: Box<BuildHooks>,
}

impl PluginFactory for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> {
        (self.build)(ctx)
    }
}

/// Creates a plugin factory from a closure.
pub fn plugin_fn<F>(name: impl Into<String>, build: F) -> Arc<dyn PluginFactory>
where
    F: Fn(&PluginContext<'_>) -> Result<Box<dyn RequestHooks>, BoxError> + Send + Sync + 'static,
{
    Arc::new(FnPlugin {
        name: name.into(),
        build: Box::new(build),
    })
}

// =============================================================================
// PluginRegistry
// =============================================================================

#[derive(Default)]
struct RegistryState {
    base: Vec<Arc<dyn PluginFactory>>,
    global: Vec<Arc<dyn PluginFactory>>,
    priorities: HashMap<String, i32>,
}

impl RegistryState {
    /// Gives every unknown plugin a priority above the current maximum.
    fn ensure_priorities(&mut self, plugins: &[Arc<dyn PluginFactory>]) {
        for plugin in plugins {
            if !self.priorities.contains_key(plugin.name()) {
                let next = self.priorities.values().copied().max().unwrap_or(0).max(0) + PRIORITY_STEP;
                self.priorities.insert(plugin.name().to_owned(), next);
            }
        }
    }

    fn priority_of(&self, name: &str) -> i32 {
        self.priorities.get(name).copied().unwrap_or(0)
    }
}

/// Ordered, de-duplicated, priority-sorted plugin registry.
#[derive(Default)]
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the built-in plugin set and its fixed priorities.
    pub fn set_base<N: Into<String>>(
        &self,
        plugins: Vec<Arc<dyn PluginFactory>>,
        priorities: impl IntoIterator<Item = (N, i32)>,
    ) {
        let mut state = self.state.write();
        for (name, priority) in priorities {
            state.priorities.insert(name.into(), priority);
        }
        state.ensure_priorities(&plugins);
        state.base = plugins;
    }

    /// Global registration: replaces the global plugin list and overrides
    /// the given priorities.
    pub fn define<N: Into<String>>(
        &self,
        plugins: Vec<Arc<dyn PluginFactory>>,
        priorities: impl IntoIterator<Item = (N, i32)>,
    ) {
        let mut state = self.state.write();
        for (name, priority) in priorities {
            state.priorities.insert(name.into(), priority);
        }
        state.ensure_priorities(&plugins);
        debug!(
            plugins = ?plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Global plugins defined"
        );
        state.global = plugins;
    }

    pub fn set_priority(&self, name: impl Into<String>, priority: i32) {
        self.state.write().priorities.insert(name.into(), priority);
    }

    pub fn priority(&self, name: &str) -> Option<i32> {
        self.state.read().priorities.get(name).copied()
    }

    /// Returns the effective plugin list for an instance with `per_call`
    /// plugins.
    pub fn resolve(&self, per_call: &[Arc<dyn PluginFactory>]) -> Vec<Arc<dyn PluginFactory>> {
        let mut state = self.state.write();
        state.ensure_priorities(per_call);

        let mut merged: Vec<Arc<dyn PluginFactory>> = Vec::new();
        for plugin in state.base.iter().chain(&state.global).chain(per_call) {
            match merged.iter().position(|p| p.name() == plugin.name()) {
                Some(idx) => merged[idx] = Arc::clone(plugin),
                None => merged.push(Arc::clone(plugin)),
            }
        }

        // Stable: equal priorities keep registration order.
        merged.sort_by_key(|p| state.priority_of(p.name()));
        merged
    }

    /// Names of the base plugins.
    pub fn base_names(&self) -> Vec<String> {
        self.state
            .read()
            .base
            .iter()
            .map(|p| p.name().to_owned())
            .collect()
    }

    /// Names of the globally defined plugins.
    pub fn global_names(&self) -> Vec<String> {
        self.state
            .read()
            .global
            .iter()
            .map(|p| p.name().to_owned())
            .collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("PluginRegistry")
            .field("base", &state.base.len())
            .field("global", &state.global.len())
            .field("priorities", &state.priorities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookMap;

    fn named(name: &str) -> Arc<dyn PluginFactory> {
        plugin_fn(name, |_| Ok(Box::new(HookMap::new())))
    }

    fn names(list: &[Arc<dyn PluginFactory>]) -> Vec<&str> {
        list.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn test_resolve_sorts_by_priority() {
        let registry = PluginRegistry::new();
        registry.define(
            vec![named("C"), named("A"), named("B")],
            [("A", 5), ("B", 15), ("C", 25)],
        );

        let resolved = registry.resolve(&[]);
        assert_eq!(names(&resolved), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_auto_priority_above_max_in_registration_order() {
        let registry = PluginRegistry::new();
        registry.set_base(vec![named("ready"), named("cache")], [("ready", 10), ("cache", 20)]);
        registry.define(vec![named("x"), named("y")], Vec::<(String, i32)>::new());

        assert_eq!(registry.priority("x"), Some(30));
        assert_eq!(registry.priority("y"), Some(40));

        let resolved = registry.resolve(&[named("z")]);
        assert_eq!(names(&resolved), vec!["ready", "cache", "x", "y", "z"]);
        assert_eq!(registry.priority("z"), Some(50));
    }

    #[test]
    fn test_later_source_replaces_same_name() {
        let registry = PluginRegistry::new();
        registry.set_base(vec![named("cache")], [("cache", 20)]);

        let custom = plugin_fn("cache", |_| Err("custom cache".into()));
        let resolved = registry.resolve(&[Arc::clone(&custom)]);

        assert_eq!(resolved.len(), 1);
        assert!(Arc::ptr_eq(&resolved[0], &custom));
    }

    #[test]
    fn test_define_replaces_global_list() {
        let registry = PluginRegistry::new();
        registry.define(vec![named("a")], Vec::<(String, i32)>::new());
        registry.define(vec![named("b")], Vec::<(String, i32)>::new());

        assert_eq!(registry.global_names(), vec!["b".to_owned()]);
    }

    #[test]
    fn test_services_lookup_by_type() {
        let services = Services::new().with(42u32).with(String::from("bus"));
        assert_eq!(services.get::<u32>().as_deref(), Some(&42));
        assert!(services.get::<i64>().is_none());
        assert!(services.contains::<String>());
    }
}
