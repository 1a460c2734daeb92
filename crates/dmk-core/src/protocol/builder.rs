//! Incremental construction of command payloads.

use super::apdu::{ApduCommand, ApduError};
use super::constants::MAX_APDU_DATA_LEN;

/// Builds an [`ApduCommand`] field by field, refusing to grow the payload
/// past the single length byte.
#[derive(Debug, Clone)]
pub struct ApduBuilder {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
}

impl ApduBuilder {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
        }
    }

    pub fn add_u8(&mut self, value: u8) -> Result<&mut Self, ApduError> {
        self.add_bytes(&[value])
    }

    /// Big-endian.
    pub fn add_u16(&mut self, value: u16) -> Result<&mut Self, ApduError> {
        self.add_bytes(&value.to_be_bytes())
    }

    /// Big-endian.
    pub fn add_u32(&mut self, value: u32) -> Result<&mut Self, ApduError> {
        self.add_bytes(&value.to_be_bytes())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, ApduError> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(self)
    }

    pub fn add_ascii(&mut self, value: &str) -> Result<&mut Self, ApduError> {
        self.add_bytes(value.as_bytes())
    }

    /// Length-value field: one length byte followed by the bytes.
    pub fn add_lv(&mut self, bytes: &[u8]) -> Result<&mut Self, ApduError> {
        self.reserve(1 + bytes.len())?;
        self.data.push(bytes.len() as u8);
        self.data.extend_from_slice(bytes);
        Ok(self)
    }

    /// Bytes still available in the payload.
    pub fn remaining(&self) -> usize {
        MAX_APDU_DATA_LEN - self.data.len()
    }

    pub fn build(self) -> ApduCommand {
        ApduCommand {
            cla: self.cla,
            ins: self.ins,
            p1: self.p1,
            p2: self.p2,
            data: self.data,
        }
    }

    fn reserve(&self, additional: usize) -> Result<(), ApduError> {
        let len = self.data.len() + additional;
        if len > MAX_APDU_DATA_LEN {
            return Err(ApduError::Encoding {
                len,
                max: MAX_APDU_DATA_LEN,
            });
        }
        Ok(())
    }
}
