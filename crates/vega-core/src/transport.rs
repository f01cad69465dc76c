//! Transport abstraction between the pipeline and a concrete radio stack.
//!
//! A [`Connector`] opens a [`Link`] to one peripheral and hands back the
//! link's asynchronous status stream. The BlueZ backend lives in
//! [`crate::bluetooth`]; an in-process simulator lives in [`crate::mock`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The host radio is switched off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// No usable adapter is present.
    #[error("No Bluetooth adapter available: {0}")]
    AdapterUnavailable(String),

    /// The device address cannot be used to reach a device.
    #[error("Invalid device address '{0}'")]
    InvalidAddress(String),

    /// Link-layer connect failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Service discovery did not find the expected characteristics.
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The initialization handshake failed.
    #[error("Init failed: {0}")]
    InitFailed(String),

    /// A telemetry round trip failed.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// A response did not follow the wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation did not complete in time.
    #[error("{operation} timed out after {millis} ms")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// How long the wait lasted.
        millis: u64,
    },

    /// The link was closed underneath the caller.
    #[error("Link closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if retrying the same configuration can never succeed.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self, Self::InvalidAddress(_))
    }

    /// Short human-readable reason used in status strings.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AdapterPoweredOff => "Bluetooth off",
            Self::AdapterUnavailable(_) => "No Bluetooth adapter",
            Self::InvalidAddress(_) => "Invalid address",
            Self::ConnectFailed(_) | Self::Closed => "Connect failed",
            Self::DiscoveryFailed(_) => "Service discovery failed",
            Self::InitFailed(_) => "Init failed",
            Self::ReadFailed(_) | Self::Protocol(_) => "Read failed",
            Self::Timeout { operation, .. } => match *operation {
                "connect" => "Connect timed out",
                "init" => "Init timed out",
                _ => "Read timed out",
            },
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Asynchronous status reported by an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Informational status text.
    Status(String),
    /// The link is gone; the session must be rebuilt.
    Lost(String),
}

impl LinkEvent {
    /// Classifies a free-form status message from a radio stack.
    ///
    /// Disconnection, GATT errors and failed service discovery count as link
    /// loss; anything else is informational.
    #[must_use]
    pub fn from_status(message: impl Into<String>) -> Self {
        const LOSS_PREFIXES: [&str; 3] = ["disconnected", "gatt error", "service discovery failed"];
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if LOSS_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            Self::Lost(message)
        } else {
            Self::Status(message)
        }
    }
}

/// Receiving half of a link's status stream.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// An open connection to one peripheral.
#[async_trait]
pub trait Link: Send {
    /// Completes link-layer setup (service discovery, notification subscription).
    async fn ready(&mut self) -> TransportResult<()>;

    /// Runs the session initialization handshake.
    async fn initialize(&mut self) -> TransportResult<()>;

    /// Performs one telemetry request and returns the raw DATA_BUF payload.
    async fn read_data_buf(&mut self) -> TransportResult<Vec<u8>>;

    /// Releases the link. Must be safe to call more than once.
    async fn close(&mut self);
}

/// A freshly opened link together with its status stream.
pub struct OpenedLink {
    /// The link itself.
    pub link: Box<dyn Link>,
    /// Status events from the radio stack for this link.
    pub events: LinkEvents,
}

impl std::fmt::Debug for OpenedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedLink").finish_non_exhaustive()
    }
}

/// Opens links to peripherals by address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to the peripheral at `address`.
    async fn connect(&self, address: &str) -> TransportResult<OpenedLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_event_classification() {
        assert!(matches!(
            LinkEvent::from_status("Disconnected from device"),
            LinkEvent::Lost(_)
        ));
        assert!(matches!(LinkEvent::from_status("GATT error 133"), LinkEvent::Lost(_)));
        assert!(matches!(
            LinkEvent::from_status("Service discovery failed: no service"),
            LinkEvent::Lost(_)
        ));
        assert!(matches!(
            LinkEvent::from_status("Services discovered"),
            LinkEvent::Status(_)
        ));
    }

    #[test]
    fn test_reasons() {
        assert_eq!(TransportError::AdapterPoweredOff.reason(), "Bluetooth off");
        assert_eq!(TransportError::InitFailed("x".into()).reason(), "Init failed");
        assert_eq!(TransportError::ReadFailed("x".into()).reason(), "Read failed");
        assert_eq!(
            TransportError::Timeout { operation: "init", millis: 10 }.reason(),
            "Init timed out"
        );
    }

    #[test]
    fn test_only_invalid_address_is_terminal() {
        assert!(TransportError::InvalidAddress("zz".into()).is_configuration_error());
        assert!(!TransportError::ConnectFailed("x".into()).is_configuration_error());
        assert!(!TransportError::AdapterPoweredOff.is_configuration_error());
    }
}
