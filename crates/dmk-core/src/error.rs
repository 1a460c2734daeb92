//! Error taxonomy of the kit.

use thiserror::Error;

use crate::device::DeviceId;
use crate::protocol::{ApduError, StatusWord};
use crate::session::SessionId;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum DmkError {
    /// Malformed outgoing command or truncated/invalid response.
    #[error(transparent)]
    Apdu(#[from] ApduError),

    /// Handshake failed or the device vanished; the device can be retried.
    #[error("Failed to connect to {device_id}: {source}")]
    Connection {
        device_id: DeviceId,
        #[source]
        source: TransportError,
    },

    #[error("Device {device_id} already has an open session ({session_id})")]
    AlreadyConnected {
        device_id: DeviceId,
        session_id: SessionId,
    },

    #[error("A connection to {0} is already in progress")]
    ConnectInProgress(DeviceId),

    /// Teardown failed; the session is unregistered anyway.
    #[error("Failed to disconnect {session_id}: {source}")]
    Disconnection {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The device answered with a status word other than `0x9000`.
    #[error("Unexpected status word: {}", .0.to_hex())]
    UnexpectedStatus(StatusWord),

    #[error("Transport error on {session_id}: {source}")]
    Transport {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },

    #[error("Command on {session_id} timed out after {timeout_ms}ms")]
    Timeout { session_id: SessionId, timeout_ms: u64 },
}

impl DmkError {
    /// Connection failures leave the device eligible for a retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DmkError::Connection { .. }
                | DmkError::AlreadyConnected { .. }
                | DmkError::ConnectInProgress(_)
        )
    }

    /// Raw status word of an [`DmkError::UnexpectedStatus`].
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DmkError::UnexpectedStatus(sw) => Some(sw.code()),
            _ => None,
        }
    }
}

pub type Result<T, E = DmkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_status_message() {
        let err = DmkError::UnexpectedStatus(StatusWord::from(0x6A82));
        assert_eq!(err.to_string(), "Unexpected status word: 6a82");
        assert_eq!(err.status_code(), Some(0x6A82));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_connection_classification() {
        let err = DmkError::Connection {
            device_id: DeviceId::new("hid-1"),
            source: TransportError::DeviceNotFound(DeviceId::new("hid-1")),
        };
        assert!(err.is_connection_error());
        assert!(DmkError::ConnectInProgress(DeviceId::new("hid-1")).is_connection_error());
    }
}
