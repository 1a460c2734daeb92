//! Protocol module - APDU wire format definitions.

pub mod apdu;
pub mod builder;
pub mod constants;
pub mod parser;
pub mod status;

pub use apdu::{ApduCommand, ApduError, ApduResponse, is_success};
pub use builder::ApduBuilder;
pub use constants::*;
pub use parser::{ApduParser, encode_to_hex_string};
pub use status::{StatusWord, format_status_word};
