//! Mock transport for testing.
//!
//! Each mock device answers frames from a queue of scripted replies; when
//! the queue is empty, a small [`SimulatedDevice`] answers the dashboard
//! and BOLOS commands this crate issues itself.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{Channel, Transport, TransportError};
use crate::device::{AppInfo, DeviceDescriptor, DeviceId, DeviceModelId, TransportKind};
use crate::protocol::ApduResponse;
use crate::protocol::constants::*;
use crate::sync::lock;

/// Scripted reply for the next read.
#[derive(Debug, Clone)]
enum MockReply {
    Bytes(Vec<u8>),
    Delayed { after: Duration, bytes: Vec<u8> },
    Disconnect,
    ReadError(String),
}

/// Minimal behaviour of a device for unscripted frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    /// Running application; `None` shows the dashboard.
    pub app: Option<AppInfo>,
    /// PIN screen displayed: every command answers `0x5515`.
    pub locked: bool,
    /// Battery charge, for models that have one.
    pub battery: Option<u8>,
    pub os_version: String,
    pub model: DeviceModelId,
}

impl SimulatedDevice {
    pub fn new(model: DeviceModelId) -> Self {
        Self {
            app: None,
            locked: false,
            battery: model.has_battery().then_some(100),
            os_version: "2.2.3".to_string(),
            model,
        }
    }

    pub fn with_app(mut self, name: &str, version: &str) -> Self {
        self.app = Some(AppInfo {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Answer one command frame.
    pub fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < APDU_HEADER_LEN {
            return status(SW_WRONG_LENGTH);
        }
        if self.locked {
            return status(SW_DEVICE_LOCKED);
        }
        let (cla, ins, p1) = (frame[0], frame[1], frame[2]);
        let data = &frame[APDU_HEADER_LEN..];

        match (cla, ins) {
            (CLA_BOLOS, INS_GET_APP_AND_VERSION) => {
                let (name, version) = match &self.app {
                    Some(app) => (app.name.as_str(), app.version.as_str()),
                    None => (DASHBOARD_APP_NAME, self.os_version.as_str()),
                };
                let mut out = vec![APP_AND_VERSION_FORMAT];
                push_lv(&mut out, name.as_bytes());
                push_lv(&mut out, version.as_bytes());
                push_lv(&mut out, &[0x00]);
                ApduResponse::new(out, SW_OK).to_bytes()
            }
            (CLA_BOLOS, INS_CLOSE_APP) => {
                self.app = None;
                status(SW_OK)
            }
            (CLA_DASHBOARD, _) if self.app.is_some() => status(SW_CLA_NOT_SUPPORTED),
            (CLA_DASHBOARD, INS_GET_OS_VERSION) => {
                let mut out = self.model.target_id().unwrap_or(0).to_be_bytes().to_vec();
                push_lv(&mut out, self.os_version.as_bytes());
                push_lv(&mut out, &[0x00, 0x00, 0x00, 0x00]);
                push_lv(&mut out, b"5.24");
                push_lv(&mut out, b"2.61");
                push_lv(&mut out, &[0x00]);
                ApduResponse::new(out, SW_OK).to_bytes()
            }
            (CLA_DASHBOARD, INS_OPEN_APP) => match std::str::from_utf8(data) {
                Ok(name) if !name.is_empty() => {
                    self.app = Some(AppInfo {
                        name: name.to_string(),
                        version: "1.0.0".to_string(),
                    });
                    status(SW_OK)
                }
                _ => status(SW_APP_NOT_FOUND),
            },
            (CLA_DASHBOARD, INS_GET_BATTERY_STATUS) => match (p1, self.battery) {
                (0x00, Some(level)) => ApduResponse::new(vec![level], SW_OK).to_bytes(),
                _ => status(SW_INS_NOT_SUPPORTED),
            },
            (CLA_DASHBOARD | CLA_BOLOS, _) => status(SW_INS_NOT_SUPPORTED),
            _ => status(SW_CLA_NOT_SUPPORTED),
        }
    }
}

fn status(code: u16) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

fn push_lv(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

struct MockDevice {
    descriptor: DeviceDescriptor,
    visible: bool,
    replies: VecDeque<MockReply>,
    writes: Vec<Vec<u8>>,
    sim: SimulatedDevice,
    fail_next_open: bool,
    fail_next_write: bool,
    fail_close: bool,
    open_channels: usize,
}

#[derive(Default)]
struct MockState {
    devices: BTreeMap<DeviceId, MockDevice>,
    enumerate_error: Option<String>,
}

/// Mock transport for unit testing discovery, sessions and dispatch.
///
/// Cloning yields another handle on the same devices, so a test can keep
/// scripting the transport after handing it to the kit.
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Simulated)
    }

    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    fn with_device<R>(&self, id: &DeviceId, f: impl FnOnce(&mut MockDevice) -> R) -> Option<R> {
        self.lock().devices.get_mut(id).map(f)
    }

    /// Add (or make visible again) a device with default simulated behaviour.
    pub fn add_device(&self, descriptor: DeviceDescriptor) {
        let sim = SimulatedDevice::new(descriptor.model_id);
        self.add_simulated(descriptor, sim);
    }

    pub fn add_simulated(&self, descriptor: DeviceDescriptor, sim: SimulatedDevice) {
        let mut state = self.lock();
        match state.devices.get_mut(&descriptor.id) {
            Some(device) => {
                device.visible = true;
                device.descriptor = descriptor;
                device.sim = sim;
            }
            None => {
                state.devices.insert(
                    descriptor.id.clone(),
                    MockDevice {
                        descriptor,
                        visible: true,
                        replies: VecDeque::new(),
                        writes: Vec::new(),
                        sim,
                        fail_next_open: false,
                        fail_next_write: false,
                        fail_close: false,
                        open_channels: 0,
                    },
                );
            }
        }
    }

    /// Simulate unplugging: hidden from enumeration, open channels fail.
    pub fn remove_device(&self, id: &DeviceId) {
        self.with_device(id, |d| d.visible = false);
    }

    /// Simulate plugging the same device back in.
    pub fn reconnect_device(&self, id: &DeviceId) {
        self.with_device(id, |d| d.visible = true);
    }

    /// Queue a raw reply (`data || SW1 SW2`) for the next read.
    pub fn queue_reply(&self, id: &DeviceId, bytes: &[u8]) {
        self.with_device(id, |d| d.replies.push_back(MockReply::Bytes(bytes.to_vec())));
    }

    /// Queue a status-only reply.
    pub fn queue_status(&self, id: &DeviceId, sw: u16) {
        self.queue_reply(id, &sw.to_be_bytes());
    }

    /// Queue a reply delivered after `after`.
    pub fn queue_delayed_reply(&self, id: &DeviceId, after: Duration, bytes: &[u8]) {
        self.with_device(id, |d| {
            d.replies.push_back(MockReply::Delayed {
                after,
                bytes: bytes.to_vec(),
            })
        });
    }

    /// The next read reports the device unplugged.
    pub fn queue_disconnect(&self, id: &DeviceId) {
        self.with_device(id, |d| d.replies.push_back(MockReply::Disconnect));
    }

    /// The next read fails without closing the device.
    pub fn queue_read_error(&self, id: &DeviceId, message: &str) {
        self.with_device(id, |d| d.replies.push_back(MockReply::ReadError(message.to_string())));
    }

    /// The next write fails before reaching the device.
    pub fn fail_next_write(&self, id: &DeviceId) {
        self.with_device(id, |d| d.fail_next_write = true);
    }

    /// Get all captured writes.
    pub fn writes(&self, id: &DeviceId) -> Vec<Vec<u8>> {
        self.with_device(id, |d| d.writes.clone()).unwrap_or_default()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self, id: &DeviceId) {
        self.with_device(id, |d| d.writes.clear());
    }

    /// Fail the next handshake with this device.
    pub fn fail_next_open(&self, id: &DeviceId) {
        self.with_device(id, |d| d.fail_next_open = true);
    }

    /// Make every close of this device fail.
    pub fn fail_close(&self, id: &DeviceId, fail: bool) {
        self.with_device(id, |d| d.fail_close = fail);
    }

    /// Make enumeration fail (`Some`) or succeed again (`None`).
    pub fn set_enumerate_error(&self, error: Option<&str>) {
        self.lock().enumerate_error = error.map(str::to_string);
    }

    /// Change the simulated device (lock it, switch app, drain battery...).
    pub fn update_device(&self, id: &DeviceId, f: impl FnOnce(&mut SimulatedDevice)) {
        self.with_device(id, |d| f(&mut d.sim));
    }

    pub fn open_channels(&self, id: &DeviceId) -> usize {
        self.with_device(id, |d| d.open_channels).unwrap_or(0)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let state = self.lock();
        if let Some(err) = &state.enumerate_error {
            return Err(TransportError::EnumerationFailed(err.clone()));
        }
        Ok(state
            .devices
            .values()
            .filter(|d| d.visible)
            .map(|d| d.descriptor.clone())
            .collect())
    }

    async fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Channel>, TransportError> {
        let mut state = self.lock();
        let mock = state
            .devices
            .get_mut(&device.id)
            .filter(|d| d.visible)
            .ok_or_else(|| TransportError::DeviceNotFound(device.id.clone()))?;
        if mock.fail_next_open {
            mock.fail_next_open = false;
            return Err(TransportError::OpenFailed("handshake rejected".into()));
        }
        mock.open_channels += 1;
        Ok(Box::new(MockChannel {
            device_id: device.id.clone(),
            state: Arc::clone(&self.state),
            pending: None,
            closed: false,
        }))
    }
}

struct MockChannel {
    device_id: DeviceId,
    state: Arc<Mutex<MockState>>,
    pending: Option<Vec<u8>>,
    closed: bool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::WriteFailed("channel closed".into()));
        }
        {
            let mut state = lock(&self.state);
            let device = state
                .devices
                .get_mut(&self.device_id)
                .filter(|d| d.visible)
                .ok_or(TransportError::Disconnected)?;
            if device.fail_next_write {
                device.fail_next_write = false;
                return Err(TransportError::WriteFailed("endpoint stalled".into()));
            }
            device.writes.push(data.to_vec());
        }
        self.pending = Some(data.to_vec());
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let frame = self
            .pending
            .take()
            .ok_or_else(|| TransportError::ReadFailed("read without a pending frame".into()))?;

        let reply = {
            let mut state = lock(&self.state);
            let device = state
                .devices
                .get_mut(&self.device_id)
                .filter(|d| d.visible)
                .ok_or(TransportError::Disconnected)?;
            match device.replies.pop_front() {
                Some(MockReply::Disconnect) => {
                    device.visible = false;
                    return Err(TransportError::Disconnected);
                }
                Some(reply) => reply,
                None => MockReply::Bytes(device.sim.respond(&frame)),
            }
        };

        match reply {
            MockReply::Delayed { after, bytes } => {
                tokio::time::sleep(after).await;
                Ok(bytes)
            }
            MockReply::Bytes(bytes) => Ok(bytes),
            MockReply::Disconnect => Err(TransportError::Disconnected),
            MockReply::ReadError(message) => Err(TransportError::ReadFailed(message)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = lock(&self.state);
        let device = state
            .devices
            .get_mut(&self.device_id)
            .ok_or(TransportError::Disconnected)?;
        device.open_channels = device.open_channels.saturating_sub(1);
        if device.fail_close {
            return Err(TransportError::CloseFailed("device did not acknowledge".into()));
        }
        Ok(())
    }
}
