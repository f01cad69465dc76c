//! # vega-core
//!
//! Connection and telemetry pipeline for BLE radiation detectors.
//!
//! This crate provides:
//! - Bounds-checked decoding of the detector's telemetry buffer
//! - Request/response framing of the detector's command channel
//! - Per-device connection state machines with linear-capped reconnect backoff
//! - Poll scheduling with failure-streak and staleness escalation
//! - A device registry with persistence and state/reading callbacks
//!
//! ## Architecture
//!
//! Leaf modules first:
//!
//! - [`frame`] - cursor with little-endian fixed-width reads
//! - [`telemetry`] - DATA_BUF record walk, newest real-time record
//! - [`protocol`] - request encoding and response reassembly
//! - [`transport`] - `Connector` / `Link` traits the pipeline drives
//! - [`session`] - one connected lifetime: connect, ready, initialize, read, close
//! - [`backoff`], [`poll`], [`state`] - policies and the state enum
//! - [`device`] - the per-device actor
//! - [`registry`] - the device set, config fan-out and aggregate queries
//! - [`config`], [`storage`], [`error`] - configuration, persistence, errors
//!
//! Radio backends: [`bluetooth`] (BlueZ, feature `bluetooth`) and [`mock`]
//! (in-process simulator, default builds and feature `mock-bluetooth`).

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod backoff;
#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod frame;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod transport;

// Re-export primary types for convenience
pub use backoff::ReconnectBackoff;
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluezConnector;
pub use config::{
    is_valid_color, is_valid_mac_address, ConfigError, ConfigResult, DeviceConfig, DeviceId,
    PipelineConfig, ServerConfig, VegaConfig,
};
pub use device::{DeviceSessionState, DeviceSnapshot};
pub use error::{Result, VegaError};
pub use events::EventSink;
pub use frame::{FrameError, FrameReader};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MockConnector, MockDevice, MockRead, MockStep};
pub use poll::{PollPolicy, PollTracker, PollVerdict};
pub use registry::DeviceRegistry;
pub use session::{Milestone, Session};
pub use state::ConnectionState;
pub use storage::{
    default_data_dir, default_devices_path, DeviceStore, JsonDeviceStore, MemoryDeviceStore,
    StoreError,
};
pub use telemetry::{decode_latest_realtime, RealtimeRecord, Reading, DOSE_RATE_DISPLAY_SCALE};
pub use transport::{Connector, Link, LinkEvent, OpenedLink, TransportError, TransportResult};
