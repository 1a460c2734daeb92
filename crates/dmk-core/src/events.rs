//! Event system for UI decoupling.
//!
//! Hosts register observers on the kit to follow discovery, session
//! lifecycle, APDU traffic and status changes without touching the core
//! logic. [`TracingObserver`] is the stock "console logger".

use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceId, DeviceStatus};
use crate::session::SessionId;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host called `disconnect`.
    Requested,
    /// The transport reported the device gone.
    DeviceLost,
    /// A command did not complete in time; the channel can no longer be trusted.
    Timeout,
    /// The kit was closed.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "Requested"),
            CloseReason::DeviceLost => write!(f, "Device Lost"),
            CloseReason::Timeout => write!(f, "Timeout"),
            CloseReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// APDU direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the kit.
#[derive(Debug, Clone)]
pub enum DmkEvent {
    /// A discovery scan finished.
    DevicesDiscovered { count: usize },
    /// A connect attempt started.
    Connecting { device_id: DeviceId },
    /// A connect attempt failed; the device stays discoverable.
    ConnectFailed { device_id: DeviceId, reason: String },
    /// A session was opened.
    SessionOpened {
        session_id: SessionId,
        device_id: DeviceId,
    },
    /// A session was torn down.
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    /// Frame sent/received on a session channel.
    Packet {
        session_id: SessionId,
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// The observed device status changed.
    StatusChanged {
        session_id: SessionId,
        from: DeviceStatus,
        to: DeviceStatus,
    },
}

/// Observer trait for receiving kit events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DmkObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DmkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DmkObserver for NullObserver {
    fn on_event(&self, _event: &DmkEvent) {}
}

/// Forwards every event to each registered observer, in order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn DmkObserver>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn DmkObserver>>) -> Self {
        Self { observers }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl DmkObserver for ObserverSet {
    fn on_event(&self, event: &DmkEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DmkObserver for TracingObserver {
    fn on_event(&self, event: &DmkEvent) {
        match event {
            DmkEvent::DevicesDiscovered { count } => {
                tracing::debug!(count = count, "Devices discovered");
            }
            DmkEvent::Connecting { device_id } => {
                tracing::info!(device = %device_id, "Connecting");
            }
            DmkEvent::ConnectFailed { device_id, reason } => {
                tracing::warn!(device = %device_id, "Connection failed: {}", reason);
            }
            DmkEvent::SessionOpened {
                session_id,
                device_id,
            } => {
                tracing::info!(session = %session_id, device = %device_id, "Session opened");
            }
            DmkEvent::SessionClosed { session_id, reason } => {
                tracing::info!(session = %session_id, reason = %reason, "Session closed");
            }
            DmkEvent::Packet {
                session_id,
                direction,
                length,
                data,
            } => {
                tracing::trace!(
                    session = %session_id,
                    dir = %direction,
                    len = length,
                    data = %data.as_deref().map(hex::encode).unwrap_or_default(),
                    "APDU"
                );
            }
            DmkEvent::StatusChanged {
                session_id,
                from,
                to,
            } => {
                if to.is_locked() {
                    tracing::warn!(session = %session_id, from = %from, "Device is locked");
                } else {
                    tracing::info!(session = %session_id, from = %from, to = %to, "Device status changed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl DmkObserver for Recorder {
        fn on_event(&self, event: &DmkEvent) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{:?}", event).split(' ').next().unwrap().to_string());
        }
    }

    #[test]
    fn test_observer_set_fans_out() {
        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        let set = ObserverSet::new(vec![a.clone(), b.clone(), Arc::new(NullObserver)]);
        assert_eq!(set.len(), 3);

        set.on_event(&DmkEvent::DevicesDiscovered { count: 2 });
        set.on_event(&DmkEvent::Connecting {
            device_id: DeviceId::new("sim-1"),
        });

        for recorder in [a, b] {
            assert_eq!(
                *recorder.0.lock().unwrap(),
                vec!["DevicesDiscovered", "Connecting"]
            );
        }
    }
}
