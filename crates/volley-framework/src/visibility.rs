//! Host visibility signal.
//!
//! The framework has no window of its own; the host reports focus changes
//! through a [`VisibilityBus`] registered as a runtime service. The
//! visibility and polling plugins subscribe to it.

use std::fmt;

use volley_core::{Cell, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

impl Visibility {
    pub fn is_visible(self) -> bool {
        self == Self::Visible
    }
}

/// Process-wide visibility state with change notification.
#[derive(Clone, Default)]
pub struct VisibilityBus {
    state: Cell<Visibility>,
}

impl VisibilityBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Visibility {
        self.state.get()
    }

    pub fn is_visible(&self) -> bool {
        self.get().is_visible()
    }

    /// Reports a change. Listeners are notified only on transitions.
    pub fn set(&self, visibility: Visibility) {
        self.state.set_if_changed(visibility);
    }

    pub fn set_visible(&self, visible: bool) {
        self.set(if visible {
            Visibility::Visible
        } else {
            Visibility::Hidden
        });
    }

    pub fn subscribe(&self, listener: impl Fn(Visibility) + Send + Sync + 'static) -> Subscription {
        self.state.subscribe(move |v| listener(*v))
    }

    pub fn listener_count(&self) -> usize {
        self.state.subscriber_count()
    }
}

impl fmt::Debug for VisibilityBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityBus")
            .field("state", &self.get())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
