//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use vega_core::DeviceRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

/// Handle passed to every handler.
pub type SharedState = AppState;

struct AppStateInner {
    registry: Arc<DeviceRegistry>,
    started_at: Instant,
}

impl AppState {
    /// Create new application state around a running registry.
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                started_at: Instant::now(),
            }),
        }
    }

    /// The device registry.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}
