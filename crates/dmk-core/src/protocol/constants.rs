//! Protocol constants for the Ledger APDU command set.
//!
//! Values follow the BOLOS dashboard and the device management SDK.

// ============================================================================
// Device Identification
// ============================================================================

/// Ledger SAS USB Vendor ID
pub const LEDGER_VENDOR_ID: u16 = 0x2C97;

// USB product id high byte (product id >> 8) per model.
pub const USB_PRODUCT_NANO_S: u8 = 0x10;
pub const USB_PRODUCT_NANO_X: u8 = 0x40;
pub const USB_PRODUCT_NANO_SP: u8 = 0x50;
pub const USB_PRODUCT_STAX: u8 = 0x60;
pub const USB_PRODUCT_FLEX: u8 = 0x70;

// Legacy (bootloader-era) product ids.
pub const USB_LEGACY_NANO_S: u8 = 0x01;
pub const USB_LEGACY_NANO_X: u8 = 0x04;
pub const USB_LEGACY_NANO_SP: u8 = 0x05;
pub const USB_LEGACY_STAX: u8 = 0x06;
pub const USB_LEGACY_FLEX: u8 = 0x07;

// OS target ids, as reported by GET_OS_VERSION.
pub const TARGET_ID_NANO_S: u32 = 0x3110_0002;
pub const TARGET_ID_NANO_X: u32 = 0x3300_0004;
pub const TARGET_ID_NANO_SP: u32 = 0x3310_0004;
pub const TARGET_ID_STAX: u32 = 0x3320_0004;
pub const TARGET_ID_FLEX: u32 = 0x3330_0004;

// ============================================================================
// Frame Layout
// ============================================================================

/// Maximum payload of a short APDU (single length byte).
pub const MAX_APDU_DATA_LEN: usize = 255;

/// CLA INS P1 P2 LC
pub const APDU_HEADER_LEN: usize = 5;

/// SW1 SW2
pub const STATUS_WORD_LEN: usize = 2;

// ============================================================================
// Instruction Classes and Codes (Host -> Device)
// ============================================================================

/// Dashboard / OS class.
pub const CLA_DASHBOARD: u8 = 0xE0;
/// BOLOS class, answered by the OS whatever app is running.
pub const CLA_BOLOS: u8 = 0xB0;

/// GET_APP_AND_VERSION (CLA_BOLOS)
pub const INS_GET_APP_AND_VERSION: u8 = 0x01;
/// CLOSE_APP (CLA_BOLOS)
pub const INS_CLOSE_APP: u8 = 0xA7;
/// GET_OS_VERSION (CLA_DASHBOARD)
pub const INS_GET_OS_VERSION: u8 = 0x01;
/// OPEN_APP (CLA_DASHBOARD)
pub const INS_OPEN_APP: u8 = 0xD8;
/// GET_BATTERY_STATUS (CLA_DASHBOARD)
pub const INS_GET_BATTERY_STATUS: u8 = 0x10;

/// Only format understood in GET_APP_AND_VERSION responses.
pub const APP_AND_VERSION_FORMAT: u8 = 0x01;

/// Name reported by GET_APP_AND_VERSION while the dashboard is displayed.
pub const DASHBOARD_APP_NAME: &str = "BOLOS";

// ============================================================================
// Status Words (Device -> Host)
// ============================================================================

pub const SW_OK: u16 = 0x9000;
pub const SW_DEVICE_LOCKED: u16 = 0x5515;
pub const SW_USER_REFUSED: u16 = 0x5501;
pub const SW_APP_NOT_FOUND: u16 = 0x6807;
pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_INCORRECT_DATA: u16 = 0x6A80;
pub const SW_NOT_FOUND: u16 = 0x6A82;
pub const SW_WRONG_P1P2: u16 = 0x6A86;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;
