//! Transport layer abstraction.
//!
//! Defines the [`Transport`] trait (enumeration + opening) and the
//! [`Channel`] trait (one ordered, half-duplex byte pipe per device),
//! allowing different implementations (USB-HID, BLE, simulator, mock).

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{DeviceDescriptor, DeviceId, TransportKind};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("No transport registered for {0}")]
    Unsupported(TransportKind),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Close failed: {0}")]
    CloseFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A family of devices reachable the same way.
///
/// This trait enables:
/// - Production implementations living next to the host application
/// - Mock implementation for unit testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind reported in the descriptors of this transport.
    fn kind(&self) -> TransportKind;

    /// Devices currently reachable.
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open an exclusive channel to `device` (the transport handshake).
    async fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Channel>, TransportError>;
}

/// An open, ordered byte channel to one device.
///
/// Half-duplex: each `write` of a frame is answered by exactly one `read`.
#[async_trait]
pub trait Channel: Send {
    /// Send one complete frame.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the reply to the last frame.
    async fn read(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Release the device.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// One request/response round trip.
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.write(frame).await?;
        self.read().await
    }
}
