//! Shared router state.

use std::sync::Arc;

use cinder_flow::store::Store;
use cinder_flow::watchdog::KillSwitch;

/// State shared by all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// The shared store.
    pub store: Arc<dyn Store>,
    /// Kill switch for the supervised orchestrator.
    pub kill: KillSwitch,
    /// Default `max_retries` stamped on submitted tasks that omit it.
    pub max_retries_default: u32,
}

impl AppState {
    /// Creates router state over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, kill: KillSwitch, max_retries_default: u32) -> Self {
        Self {
            store,
            kill,
            max_retries_default,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("max_retries_default", &self.max_retries_default)
            .finish_non_exhaustive()
    }
}
