//! Sessions: live, identified connections to one device.

pub mod manager;
pub mod state;

use std::fmt;
use std::time::SystemTime;

use crate::device::DeviceDescriptor;

pub use manager::SessionManager;
pub use state::SessionState;

/// Process-unique session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A connected device, as handed out by [`SessionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    device: DeviceDescriptor,
    created_at: SystemTime,
}

impl Session {
    pub(crate) fn new(id: SessionId, device: DeviceDescriptor) -> Self {
        Self {
            id,
            device,
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}
