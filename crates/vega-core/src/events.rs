//! Downstream callbacks.
//!
//! Listeners are plain function values. Device tasks call them concurrently,
//! so they must be cheap and must not block.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::DeviceId;
use crate::state::ConnectionState;
use crate::telemetry::Reading;

/// Called on every state or status change: `(device_id, state, status)`.
pub type StateListener = Arc<dyn Fn(DeviceId, ConnectionState, &str) + Send + Sync>;

/// Called for every decoded reading:
/// `(device_id, dose_rate µSv/h, count_rate cps, timestamp_ms)`.
pub type ReadingListener = Arc<dyn Fn(DeviceId, f64, f64, i64) + Send + Sync>;

/// Fan-out point for state and reading callbacks.
#[derive(Default)]
pub struct EventSink {
    state: RwLock<Vec<StateListener>>,
    reading: RwLock<Vec<ReadingListener>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("state_listeners", &self.state_listeners().len())
            .field("reading_listeners", &self.reading_listeners().len())
            .finish()
    }
}

impl EventSink {
    /// Creates a sink with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a state listener.
    pub fn on_state(&self, listener: impl Fn(DeviceId, ConnectionState, &str) + Send + Sync + 'static) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Registers a reading listener.
    pub fn on_reading(&self, listener: impl Fn(DeviceId, f64, f64, i64) + Send + Sync + 'static) {
        self.reading
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    // Listeners run outside the lock so they may register further listeners.
    fn state_listeners(&self) -> Vec<StateListener> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn reading_listeners(&self) -> Vec<ReadingListener> {
        self.reading.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn emit_state(&self, device_id: DeviceId, state: ConnectionState, status: &str) {
        for listener in self.state_listeners() {
            listener(device_id, state, status);
        }
    }

    pub(crate) fn emit_reading(&self, reading: &Reading) {
        for listener in self.reading_listeners() {
            listener(
                reading.device_id,
                reading.dose_rate,
                reading.count_rate,
                reading.timestamp_ms,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_fan_out_to_all_listeners() {
        let sink = EventSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            sink.on_state(move |_, state, status| {
                seen.lock().unwrap().push(format!("{tag}:{state}:{status}"));
            });
        }
        sink.emit_state(Uuid::nil(), ConnectionState::Connecting, "Connecting...");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:connecting:Connecting...", "b:connecting:Connecting..."]
        );
    }

    #[test]
    fn test_reading_arguments() {
        let sink = EventSink::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            sink.on_reading(move |id, dose, count, ts| {
                *seen.lock().unwrap() = Some((id, dose, count, ts));
            });
        }
        let id = Uuid::now_v7();
        sink.emit_reading(&Reading {
            device_id: id,
            dose_rate: 0.12,
            count_rate: 5.0,
            timestamp_ms: 1_700_000_000_000,
        });
        assert_eq!(*seen.lock().unwrap(), Some((id, 0.12, 5.0, 1_700_000_000_000)));
    }
}
