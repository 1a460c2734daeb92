//! Cursor-based extraction of response fields.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use super::apdu::{ApduError, ApduResponse};

/// Reads big-endian integers and length-value fields out of a response
/// payload, failing with a decoding error on truncation.
pub struct ApduParser<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ApduParser<'a> {
    pub fn new(response: &'a ApduResponse) -> Self {
        Self::from_bytes(&response.data)
    }

    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn extract_u8(&mut self) -> Result<u8, ApduError> {
        self.check(1)?;
        Ok(self.cursor.read_u8()?)
    }

    pub fn extract_u16(&mut self) -> Result<u16, ApduError> {
        self.check(2)?;
        Ok(self.cursor.read_u16::<BigEndian>()?)
    }

    pub fn extract_u32(&mut self) -> Result<u32, ApduError> {
        self.check(4)?;
        Ok(self.cursor.read_u32::<BigEndian>()?)
    }

    pub fn extract_bytes(&mut self, len: usize) -> Result<&'a [u8], ApduError> {
        self.check(len)?;
        let start = self.offset();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    /// One length byte, then that many bytes.
    pub fn extract_lv(&mut self) -> Result<&'a [u8], ApduError> {
        let len = self.extract_u8()? as usize;
        self.extract_bytes(len)
    }

    pub fn extract_lv_string(&mut self) -> Result<String, ApduError> {
        let offset = self.offset();
        let bytes = self.extract_lv()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ApduError::InvalidUtf8 { offset })
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.offset())
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    fn check(&self, needed: usize) -> Result<(), ApduError> {
        let available = self.remaining();
        if available < needed {
            return Err(ApduError::Truncated {
                offset: self.offset(),
                needed,
                available,
            });
        }
        Ok(())
    }
}

/// Lowercase hex of arbitrary bytes, for logs and error messages.
pub fn encode_to_hex_string(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sequence() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 3, b'a', b'b', b'c'];
        let mut parser = ApduParser::from_bytes(&data);
        assert_eq!(parser.extract_u8().unwrap(), 0x01);
        assert_eq!(parser.extract_u16().unwrap(), 0x0203);
        assert_eq!(parser.extract_u32().unwrap(), 0x0405_0607);
        assert_eq!(parser.extract_lv_string().unwrap(), "abc");
        assert!(parser.is_empty());
    }

    #[test]
    fn test_truncated_lv() {
        let data = [5, b'a', b'b'];
        let mut parser = ApduParser::from_bytes(&data);
        let err = parser.extract_lv().unwrap_err();
        assert!(matches!(
            err,
            ApduError::Truncated {
                offset: 1,
                needed: 5,
                available: 2
            }
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [2, 0xFF, 0xFE];
        let mut parser = ApduParser::from_bytes(&data);
        assert!(matches!(
            parser.extract_lv_string().unwrap_err(),
            ApduError::InvalidUtf8 { offset: 0 }
        ));
    }

    #[test]
    fn test_parser_over_response() {
        let resp = ApduResponse::decode(&[0xCA, 0xFE, 0x90, 0x00]).unwrap();
        let mut parser = ApduParser::new(&resp);
        assert_eq!(parser.remaining(), 2);
        assert_eq!(parser.extract_u16().unwrap(), 0xCAFE);
        assert!(parser.extract_u8().is_err());
        assert_eq!(encode_to_hex_string(&resp.data), "cafe");
    }
}
