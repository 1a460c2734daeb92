//! Session lifecycle state machine.

use std::fmt;

/// Lifecycle of a device connection.
///
/// `Discovered -> Connecting -> Connected -> Disconnecting -> Closed`; a
/// failed connect falls back from `Connecting` to `Discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Visible through a transport, no session.
    #[default]
    Discovered,
    /// Transport handshake in progress.
    Connecting,
    /// Session registered and usable.
    Connected,
    /// Teardown in progress; no new commands are accepted.
    Disconnecting,
    /// Session gone; every subscription has completed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Discovered => write!(f, "DISCOVERED"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Disconnecting => write!(f, "DISCONNECTING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

impl SessionState {
    /// Whether commands may be sent.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Whether the session is being, or has been, torn down.
    pub fn is_terminating(&self) -> bool {
        matches!(self, SessionState::Disconnecting | SessionState::Closed)
    }

    /// Legal transitions of the lifecycle.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Discovered)
                | (Connected, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}
