//! Structured device commands.
//!
//! A command knows how to build its APDU and how to read the data of a
//! successful response. The dispatcher checks the status word before
//! [`Command::parse`] is called, so parsers only ever see `0x9000` replies.

mod app;
mod battery;
mod os;

pub use app::{AppAndVersion, CloseApp, GetAppAndVersion, OpenApp};
pub use battery::{BatteryFlags, BatteryReading, BatteryStatusType, GetBatteryStatus};
pub use os::{GetOsVersion, OsVersion};

use crate::protocol::{ApduCommand, ApduError, ApduResponse};

/// One request/response exchange with typed output.
pub trait Command: Send + Sync {
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Build the outgoing APDU.
    fn apdu(&self) -> Result<ApduCommand, ApduError>;

    /// Parse the data of a successful response.
    fn parse(&self, response: &ApduResponse) -> Result<Self::Output, ApduError>;
}

/// Commands that answer with status only.
pub(crate) fn expect_empty(name: &'static str, response: &ApduResponse) -> Result<(), ApduError> {
    if response.data.is_empty() {
        Ok(())
    } else {
        Err(ApduError::InvalidField {
            field: name,
            reason: format!("unexpected {} byte payload", response.data.len()),
        })
    }
}
