//! Status word parsing and matching.
//!
//! Every APDU response ends with a 2-byte status word. `0x9000` is the
//! only success value; everything else is an application status that the
//! issuing command (or its caller) interprets.

use std::fmt;

use super::constants::*;

/// Named view over a raw status word.
///
/// Conversion from and to `u16` is lossless: unknown words are kept in
/// [`StatusWord::Unknown`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusWord {
    Ok,
    DeviceLocked,
    UserRefused,
    AppNotFound,
    WrongLength,
    SecurityStatusNotSatisfied,
    ConditionsNotSatisfied,
    IncorrectData,
    NotFound,
    WrongP1P2,
    InsNotSupported,
    ClaNotSupported,
    Unknown(u16),
}

impl StatusWord {
    /// Raw 16-bit value.
    pub const fn code(self) -> u16 {
        match self {
            StatusWord::Ok => SW_OK,
            StatusWord::DeviceLocked => SW_DEVICE_LOCKED,
            StatusWord::UserRefused => SW_USER_REFUSED,
            StatusWord::AppNotFound => SW_APP_NOT_FOUND,
            StatusWord::WrongLength => SW_WRONG_LENGTH,
            StatusWord::SecurityStatusNotSatisfied => SW_SECURITY_STATUS_NOT_SATISFIED,
            StatusWord::ConditionsNotSatisfied => SW_CONDITIONS_NOT_SATISFIED,
            StatusWord::IncorrectData => SW_INCORRECT_DATA,
            StatusWord::NotFound => SW_NOT_FOUND,
            StatusWord::WrongP1P2 => SW_WRONG_P1P2,
            StatusWord::InsNotSupported => SW_INS_NOT_SUPPORTED,
            StatusWord::ClaNotSupported => SW_CLA_NOT_SUPPORTED,
            StatusWord::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() == SW_OK
    }

    /// Statuses returned by the OS while the PIN screen is shown.
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            StatusWord::DeviceLocked | StatusWord::SecurityStatusNotSatisfied
        )
    }

    /// Lowercase hex rendering, e.g. `6a82`. Diagnostics only.
    pub fn to_hex(self) -> String {
        format_status_word(self.code())
    }

    fn label(self) -> &'static str {
        match self {
            StatusWord::Ok => "OK",
            StatusWord::DeviceLocked => "DEVICE_LOCKED",
            StatusWord::UserRefused => "USER_REFUSED",
            StatusWord::AppNotFound => "APP_NOT_FOUND",
            StatusWord::WrongLength => "WRONG_LENGTH",
            StatusWord::SecurityStatusNotSatisfied => "SECURITY_STATUS_NOT_SATISFIED",
            StatusWord::ConditionsNotSatisfied => "CONDITIONS_NOT_SATISFIED",
            StatusWord::IncorrectData => "INCORRECT_DATA",
            StatusWord::NotFound => "NOT_FOUND",
            StatusWord::WrongP1P2 => "WRONG_P1P2",
            StatusWord::InsNotSupported => "INS_NOT_SUPPORTED",
            StatusWord::ClaNotSupported => "CLA_NOT_SUPPORTED",
            StatusWord::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(code: u16) -> Self {
        match code {
            SW_OK => StatusWord::Ok,
            SW_DEVICE_LOCKED => StatusWord::DeviceLocked,
            SW_USER_REFUSED => StatusWord::UserRefused,
            SW_APP_NOT_FOUND => StatusWord::AppNotFound,
            SW_WRONG_LENGTH => StatusWord::WrongLength,
            SW_SECURITY_STATUS_NOT_SATISFIED => StatusWord::SecurityStatusNotSatisfied,
            SW_CONDITIONS_NOT_SATISFIED => StatusWord::ConditionsNotSatisfied,
            SW_INCORRECT_DATA => StatusWord::IncorrectData,
            SW_NOT_FOUND => StatusWord::NotFound,
            SW_WRONG_P1P2 => StatusWord::WrongP1P2,
            SW_INS_NOT_SUPPORTED => StatusWord::InsNotSupported,
            SW_CLA_NOT_SUPPORTED => StatusWord::ClaNotSupported,
            other => StatusWord::Unknown(other),
        }
    }
}

impl From<StatusWord> for u16 {
    fn from(sw: StatusWord) -> Self {
        sw.code()
    }
}

/// Hex-encode a status word (`0x6A82` -> `"6a82"`).
pub fn format_status_word(code: u16) -> String {
    hex::encode(code.to_be_bytes())
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:04X} {})", self.code(), self.label())
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.code())
    }
}
