//! Device descriptors and observed device state.
//!
//! Descriptors are produced by discovery and never change; a device's
//! identity is its [`DeviceId`]. [`DeviceState`] is what the state monitor
//! learns about a connected device over time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Opaque, transport-assigned device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of transport a device was discovered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    Usb,
    Ble,
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "USB"),
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Simulated => write!(f, "SIMULATED"),
        }
    }
}

/// Hardware model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceModelId {
    NanoS,
    NanoSP,
    NanoX,
    Stax,
    Flex,
    Unknown,
}

impl DeviceModelId {
    /// Map a Ledger USB product id (current or legacy numbering).
    pub fn from_usb_product_id(product_id: u16) -> Self {
        let high = (product_id >> 8) as u8;
        let key = if high == 0 { product_id as u8 } else { high };
        match key {
            USB_PRODUCT_NANO_S | USB_LEGACY_NANO_S => DeviceModelId::NanoS,
            USB_PRODUCT_NANO_X | USB_LEGACY_NANO_X => DeviceModelId::NanoX,
            USB_PRODUCT_NANO_SP | USB_LEGACY_NANO_SP => DeviceModelId::NanoSP,
            USB_PRODUCT_STAX | USB_LEGACY_STAX => DeviceModelId::Stax,
            USB_PRODUCT_FLEX | USB_LEGACY_FLEX => DeviceModelId::Flex,
            _ => DeviceModelId::Unknown,
        }
    }

    /// Map an OS target id from GET_OS_VERSION.
    pub fn from_target_id(target_id: u32) -> Self {
        match target_id {
            TARGET_ID_NANO_S => DeviceModelId::NanoS,
            TARGET_ID_NANO_X => DeviceModelId::NanoX,
            TARGET_ID_NANO_SP => DeviceModelId::NanoSP,
            TARGET_ID_STAX => DeviceModelId::Stax,
            TARGET_ID_FLEX => DeviceModelId::Flex,
            _ => DeviceModelId::Unknown,
        }
    }

    pub fn target_id(self) -> Option<u32> {
        match self {
            DeviceModelId::NanoS => Some(TARGET_ID_NANO_S),
            DeviceModelId::NanoX => Some(TARGET_ID_NANO_X),
            DeviceModelId::NanoSP => Some(TARGET_ID_NANO_SP),
            DeviceModelId::Stax => Some(TARGET_ID_STAX),
            DeviceModelId::Flex => Some(TARGET_ID_FLEX),
            DeviceModelId::Unknown => None,
        }
    }

    /// Whether the model has a battery worth polling.
    pub fn has_battery(self) -> bool {
        matches!(
            self,
            DeviceModelId::NanoX | DeviceModelId::Stax | DeviceModelId::Flex
        )
    }

    pub fn product_name(self) -> &'static str {
        match self {
            DeviceModelId::NanoS => "Ledger Nano S",
            DeviceModelId::NanoSP => "Ledger Nano S Plus",
            DeviceModelId::NanoX => "Ledger Nano X",
            DeviceModelId::Stax => "Ledger Stax",
            DeviceModelId::Flex => "Ledger Flex",
            DeviceModelId::Unknown => "Unknown device",
        }
    }
}

impl fmt::Display for DeviceModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = match self {
            DeviceModelId::NanoS => "nanoS",
            DeviceModelId::NanoSP => "nanoSP",
            DeviceModelId::NanoX => "nanoX",
            DeviceModelId::Stax => "stax",
            DeviceModelId::Flex => "flex",
            DeviceModelId::Unknown => "unknown",
        };
        f.write_str(id)
    }
}

/// A device visible through some transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportKind,
    pub model_id: DeviceModelId,
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        transport: TransportKind,
        model_id: DeviceModelId,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport,
            model_id,
        }
    }
}

/// Device status vocabulary.
///
/// The set is open: values this crate does not know are kept verbatim in
/// [`DeviceStatus::Unrecognized`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceStatus {
    Connected,
    Locked,
    Busy,
    NotConnected,
    Unrecognized(String),
}

impl DeviceStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "CONNECTED" => DeviceStatus::Connected,
            "LOCKED" => DeviceStatus::Locked,
            "BUSY" => DeviceStatus::Busy,
            "NOT CONNECTED" | "NOT_CONNECTED" => DeviceStatus::NotConnected,
            other => DeviceStatus::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Connected => "CONNECTED",
            DeviceStatus::Locked => "LOCKED",
            DeviceStatus::Busy => "BUSY",
            DeviceStatus::NotConnected => "NOT_CONNECTED",
            DeviceStatus::Unrecognized(raw) => raw,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, DeviceStatus::Locked)
    }
}

impl From<String> for DeviceStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for DeviceStatus {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<DeviceStatus> for String {
    fn from(status: DeviceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery charge in percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level: u8,
}

impl BatteryStatus {
    /// `None` if `level` is above 100.
    pub fn from_percentage(level: u8) -> Option<Self> {
        (level <= 100).then_some(Self { level })
    }
}

/// Application currently running on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

/// Last known state of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_status: DeviceStatus,
    pub battery_status: Option<BatteryStatus>,
    pub current_app: Option<AppInfo>,
    pub device_model_id: DeviceModelId,
}

impl DeviceState {
    /// State of a freshly connected device, before anything was polled.
    pub fn new(device_model_id: DeviceModelId) -> Self {
        Self {
            device_status: DeviceStatus::Connected,
            battery_status: None,
            current_app: None,
            device_model_id,
        }
    }
}
