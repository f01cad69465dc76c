//! Per-device connection state.
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting ──── ok ────► Connected
//!       ▲                       │     ▲                   │
//!       │ user disconnect       │fail │ backoff elapses   │ failure streak,
//!       │ (from any state)      ▼     │                   │ staleness, link lost
//!       └──────────────────── Reconnecting ◄──────────────┘
//!
//!  any ── malformed address ──► Error   (terminal until reconfigured)
//! ```
//!
//! - **Disconnected**: no session, no timers.
//! - **Connecting**: previous session torn down; connect and init in flight.
//! - **Connected**: session initialized, poll loop running.
//! - **Reconnecting**: no session, a backoff timer pending.
//! - **Error**: no session, no timers, no automatic retry.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle; nothing scheduled.
    #[default]
    Disconnected,
    /// Opening and initializing a session.
    Connecting,
    /// Session initialized and polling.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Configuration error; waits for a new configuration.
    Error,
}

impl ConnectionState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Reconnecting,
        Self::Error,
    ];

    /// Whether a session handle may exist in this state.
    #[must_use]
    pub const fn may_hold_session(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Whether the device is trying to be online.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Default status text when no specific reason applies.
    #[must_use]
    pub const fn status_text(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting...",
            Self::Error => "Error",
        }
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Error, Reconnecting};

        match (self, next) {
            // user disconnect and configuration errors are legal everywhere
            (_, Disconnected | Error) => true,

            (Disconnected | Error, Connecting) => true,

            (Connecting, Connected | Reconnecting) => true,
            // force reconnect restarts an attempt in flight
            (Connecting, Connecting) => true,

            (Connected, Reconnecting | Connecting) => true,

            (Reconnecting, Connecting) => true,

            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Reconnecting));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Reconnecting.can_transition_to(Error));
    }

    #[test]
    fn test_invalid_transitions() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_session_only_in_live_states() {
        let holders: Vec<_> = ConnectionState::ALL
            .into_iter()
            .filter(|s| s.may_hold_session())
            .collect();
        assert_eq!(
            holders,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}
