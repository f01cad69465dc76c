//! Unified error types for the vega core library.
//!
//! Each module has its own error type ([`FrameError`], [`TransportError`],
//! [`ConfigError`], [`StoreError`]). [`VegaError`] gathers them for callers
//! that cross module boundaries, mainly the registry and the HTTP layer.
//!
//! # Example
//!
//! ```rust
//! use vega_core::error::{Result, VegaError};
//! use uuid::Uuid;
//!
//! fn lookup(id: Uuid, known: &[Uuid]) -> Result<()> {
//!     if !known.contains(&id) {
//!         return Err(VegaError::DeviceNotFound(id));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::storage::StoreError;
use crate::transport::TransportError;

/// The unified error type for vega operations.
#[derive(Debug, Error)]
pub enum VegaError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A telemetry frame was shorter than its layout requires.
    #[error(transparent)]
    Frame(#[from] FrameError),

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// No device with this id is registered.
    #[error("Device not found: {0}")]
    DeviceNotFound(Uuid),

    /// A device with this id is already registered.
    #[error("Device already exists: {0}")]
    DeviceAlreadyExists(Uuid),

    /// The device configuration has unusable fields.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {0}")]
    ConfigNotFound(String),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for vega operations.
pub type Result<T> = std::result::Result<T, VegaError>;

impl VegaError {
    /// Wraps a field validation failure of a device configuration.
    #[must_use]
    pub fn invalid_device(err: ConfigError) -> Self {
        Self::InvalidDevice(err.to_string())
    }

    /// Returns `true` if this error came from the radio link.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Frame(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        ) || matches!(self, Self::Transport(e) if e.is_configuration_error())
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if reconnecting may clear the error without user action.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_configuration_error(),
            Self::Frame(_) => true,
            _ => false,
        }
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidDevice(_) => 400,
            Self::Transport(TransportError::InvalidAddress(_)) => 400,

            // 404 Not Found
            Self::DeviceNotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict
            Self::DeviceAlreadyExists(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the device answered with garbage
            Self::Frame(_) | Self::Transport(TransportError::Protocol(_)) => 502,

            // 503 Service Unavailable - radio or device unreachable
            Self::Transport(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(TransportError::AdapterPoweredOff) => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::Transport(TransportError::AdapterUnavailable(_)) => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::Transport(TransportError::InvalidAddress(_)) => "INVALID_ADDRESS",
            Self::Transport(TransportError::Timeout { .. }) => "TRANSPORT_TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Frame(_) => "FRAME_OUT_OF_RANGE",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::DeviceAlreadyExists(_) => "DEVICE_ALREADY_EXISTS",
            Self::InvalidDevice(_) => "INVALID_DEVICE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<ConfigError> for VegaError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { .. } | ConfigError::WriteError { .. } => {
                Self::PersistenceError(err.to_string())
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { .. } | ConfigError::MultipleValidationErrors(_) => {
                Self::ConfigValidationError(err.to_string())
            }
        }
    }
}

impl From<StoreError> for VegaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ParseError { .. } => Self::ConfigParseError(err.to_string()),
            _ => Self::PersistenceError(err.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_transport_error_classification() {
        let err = VegaError::from(TransportError::ConnectFailed("busy".into()));
        assert!(err.is_transport_error());
        assert!(err.is_recoverable());
        assert!(!err.is_config_error());

        let err = VegaError::from(TransportError::InvalidAddress("zz".into()));
        assert!(err.is_config_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(VegaError::ConfigNotFound("/test".into()).is_config_error());
        assert!(VegaError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(VegaError::ConfigValidationError("invalid value".into()).is_config_error());
        assert!(!VegaError::DeviceNotFound(Uuid::nil()).is_config_error());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(VegaError::PersistenceError("disk full".into()).is_io_error());
        assert!(VegaError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());
        assert!(!VegaError::InvalidDevice("x".into()).is_io_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(VegaError::InvalidDevice("bad".into()).http_status_code(), 400);
        assert_eq!(VegaError::DeviceNotFound(Uuid::nil()).http_status_code(), 404);
        assert_eq!(VegaError::DeviceAlreadyExists(Uuid::nil()).http_status_code(), 409);
        assert_eq!(VegaError::ConfigParseError("e".into()).http_status_code(), 422);
        assert_eq!(VegaError::PersistenceError("e".into()).http_status_code(), 500);
        assert_eq!(
            VegaError::from(TransportError::Protocol("echo".into())).http_status_code(),
            502
        );
        assert_eq!(
            VegaError::from(TransportError::AdapterPoweredOff).http_status_code(),
            503
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            VegaError::from(TransportError::AdapterPoweredOff).error_code(),
            "BLUETOOTH_ADAPTER_POWERED_OFF"
        );
        assert_eq!(
            VegaError::DeviceNotFound(Uuid::nil()).error_code(),
            "DEVICE_NOT_FOUND"
        );
        assert_eq!(
            VegaError::from(TransportError::Timeout { operation: "init", millis: 1 }).error_code(),
            "TRANSPORT_TIMEOUT"
        );
    }

    #[test]
    fn test_from_config_error() {
        let err: VegaError = ConfigError::ValidationError {
            field: "pipeline.failure_threshold",
            message: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, VegaError::ConfigValidationError(ref m) if m.contains("failure_threshold")));

        let err: VegaError = ConfigError::NotFound("/etc/vega/config.toml".into()).into();
        assert_eq!(err.http_status_code(), 404);
    }

    #[test]
    fn test_from_store_error() {
        let err: VegaError = StoreError::NoDataDir.into();
        assert!(err.is_io_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: VegaError = io_err.into();
        assert!(matches!(err, VegaError::IoError(_)));
    }

    #[test]
    fn test_error_display_messages() {
        let id = Uuid::now_v7();
        assert!(VegaError::DeviceNotFound(id).to_string().contains(&id.to_string()));
        assert_eq!(
            VegaError::from(TransportError::AdapterPoweredOff).to_string(),
            "Bluetooth adapter is powered off"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VegaError>();
        assert_sync::<VegaError>();
    }
}
