//! Dashboard OS version query.

use super::Command;
use crate::device::DeviceModelId;
use crate::protocol::constants::*;
use crate::protocol::{ApduCommand, ApduError, ApduParser, ApduResponse};

/// Firmware versions of the secure element and the MCU.
///
/// Only answered on the dashboard; applications refuse the dashboard CLA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOsVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion {
    pub target_id: u32,
    pub se_version: String,
    pub se_flags: u32,
    pub mcu_seph_version: String,
    pub mcu_bootloader_version: String,
    /// Absent on older firmware.
    pub hw_version: Option<u8>,
    pub model: DeviceModelId,
}

impl Command for GetOsVersion {
    type Output = OsVersion;

    fn name(&self) -> &'static str {
        "GetOsVersion"
    }

    fn apdu(&self) -> Result<ApduCommand, ApduError> {
        Ok(ApduCommand::new(CLA_DASHBOARD, INS_GET_OS_VERSION, 0x00, 0x00))
    }

    fn parse(&self, response: &ApduResponse) -> Result<OsVersion, ApduError> {
        let mut parser = ApduParser::new(response);
        let target_id = parser.extract_u32()?;
        let se_version = parser.extract_lv_string()?;

        let raw_flags = parser.extract_lv()?;
        if raw_flags.len() > 4 {
            return Err(ApduError::InvalidField {
                field: "se_flags",
                reason: format!("{} bytes, expected at most 4", raw_flags.len()),
            });
        }
        let se_flags = raw_flags.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        let mcu_seph_version = parser.extract_lv_string()?;
        let mcu_bootloader_version = parser.extract_lv_string()?;
        let hw_version = if parser.is_empty() {
            None
        } else {
            parser.extract_lv()?.first().copied()
        };

        Ok(OsVersion {
            target_id,
            se_version,
            se_flags,
            mcu_seph_version,
            mcu_bootloader_version,
            hw_version,
            model: DeviceModelId::from_target_id(target_id),
        })
    }
}
