//! Battery queries for models that have one.

use std::fmt;

use super::Command;
use crate::protocol::constants::*;
use crate::protocol::{ApduCommand, ApduError, ApduParser, ApduResponse};

/// What to read, sent as P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BatteryStatusType {
    Percentage = 0x00,
    Voltage = 0x01,
    Temperature = 0x02,
    Current = 0x03,
    Flags = 0x04,
}

/// Charger and battery health flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BatteryFlags(pub u32);

impl BatteryFlags {
    pub const CHARGING: u32 = 0x01;
    pub const USB_CONNECTED: u32 = 0x02;
    pub const USB_POWERED: u32 = 0x04;
    pub const BLE_CONNECTED: u32 = 0x08;
    pub const ISSUE_BATTERY: u32 = 0x10;
    pub const ISSUE_CHARGING: u32 = 0x20;
    pub const ISSUE_TEMPERATURE: u32 = 0x40;

    fn has(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    pub fn is_charging(self) -> bool {
        self.has(Self::CHARGING)
    }

    pub fn is_usb_connected(self) -> bool {
        self.has(Self::USB_CONNECTED)
    }

    pub fn is_usb_powered(self) -> bool {
        self.has(Self::USB_POWERED)
    }

    pub fn is_ble_connected(self) -> bool {
        self.has(Self::BLE_CONNECTED)
    }

    pub fn has_issue(self) -> bool {
        self.has(Self::ISSUE_BATTERY | Self::ISSUE_CHARGING | Self::ISSUE_TEMPERATURE)
    }
}

impl fmt::Debug for BatteryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatteryFlags({:#010x}", self.0)?;
        if self.is_charging() {
            write!(f, " CHARGING")?;
        }
        if self.has_issue() {
            write!(f, " ISSUE")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryReading {
    /// Charge, 0-100.
    Percentage(u8),
    /// Millivolts.
    Voltage(u16),
    /// Degrees Celsius.
    Temperature(i8),
    /// Milliamperes, negative when discharging.
    Current(i8),
    Flags(BatteryFlags),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBatteryStatus {
    pub kind: BatteryStatusType,
}

impl GetBatteryStatus {
    pub fn new(kind: BatteryStatusType) -> Self {
        Self { kind }
    }

    pub fn percentage() -> Self {
        Self::new(BatteryStatusType::Percentage)
    }
}

impl Command for GetBatteryStatus {
    type Output = BatteryReading;

    fn name(&self) -> &'static str {
        "GetBatteryStatus"
    }

    fn apdu(&self) -> Result<ApduCommand, ApduError> {
        Ok(ApduCommand::new(CLA_DASHBOARD, INS_GET_BATTERY_STATUS, self.kind as u8, 0x00))
    }

    fn parse(&self, response: &ApduResponse) -> Result<BatteryReading, ApduError> {
        let mut parser = ApduParser::new(response);
        let reading = match self.kind {
            BatteryStatusType::Percentage => {
                let level = parser.extract_u8()?;
                if level > 100 {
                    return Err(ApduError::InvalidField {
                        field: "battery percentage",
                        reason: format!("{} is above 100", level),
                    });
                }
                BatteryReading::Percentage(level)
            }
            BatteryStatusType::Voltage => BatteryReading::Voltage(parser.extract_u16()?),
            BatteryStatusType::Temperature => BatteryReading::Temperature(parser.extract_u8()? as i8),
            BatteryStatusType::Current => BatteryReading::Current(parser.extract_u8()? as i8),
            BatteryStatusType::Flags => BatteryReading::Flags(BatteryFlags(parser.extract_u32()?)),
        };
        Ok(reading)
    }
}
