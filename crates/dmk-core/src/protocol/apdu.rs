//! APDU frames: command encoding and response decoding.
//!
//! Request:  `CLA(1) INS(1) P1(1) P2(1) LEN(1) DATA(LEN)`
//! Response: `DATA(N) SW1(1) SW2(1)`

use thiserror::Error;

use super::constants::{APDU_HEADER_LEN, MAX_APDU_DATA_LEN, STATUS_WORD_LEN, SW_OK};
use super::status::StatusWord;

#[derive(Error, Debug)]
pub enum ApduError {
    #[error("Encoding error: payload of {len} bytes exceeds the {max} byte limit")]
    Encoding { len: usize, max: usize },

    #[error("Decoding error: response of {len} bytes has no status word")]
    ResponseTooShort { len: usize },

    #[error("Decoding error: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Decoding error: invalid UTF-8 in field at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("Decoding error: invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApduError {
    /// Malformed outgoing command.
    pub fn is_encoding(&self) -> bool {
        matches!(self, ApduError::Encoding { .. })
    }

    /// Malformed or truncated incoming response.
    pub fn is_decoding(&self) -> bool {
        !self.is_encoding()
    }
}

/// A command APDU. Built per call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    /// Command with an empty payload.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Serialize to `[cla, ins, p1, p2, len, data...]`.
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        if self.data.len() > MAX_APDU_DATA_LEN {
            return Err(ApduError::Encoding {
                len: self.data.len(),
                max: MAX_APDU_DATA_LEN,
            });
        }
        let mut frame = Vec::with_capacity(APDU_HEADER_LEN + self.data.len());
        frame.extend_from_slice(&[
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len() as u8,
        ]);
        frame.extend_from_slice(&self.data);
        Ok(frame)
    }
}

/// A response APDU split into payload and status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub status_code: u16,
}

impl ApduResponse {
    pub fn new(data: impl Into<Vec<u8>>, status_code: u16) -> Self {
        Self {
            data: data.into(),
            status_code,
        }
    }

    /// Split a raw reply; the trailing two bytes are the big-endian status word.
    pub fn decode(raw: &[u8]) -> Result<Self, ApduError> {
        if raw.len() < STATUS_WORD_LEN {
            return Err(ApduError::ResponseTooShort { len: raw.len() });
        }
        let (data, sw) = raw.split_at(raw.len() - STATUS_WORD_LEN);
        Ok(Self {
            data: data.to_vec(),
            status_code: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    /// Wire form of this response (`data || SW1 SW2`).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.data.len() + STATUS_WORD_LEN);
        raw.extend_from_slice(&self.data);
        raw.extend_from_slice(&self.status_code.to_be_bytes());
        raw
    }

    pub fn status_word(&self) -> StatusWord {
        StatusWord::from(self.status_code)
    }

    pub fn is_success(&self) -> bool {
        is_success(self)
    }
}

/// The single success predicate: true iff the status word is `0x9000`.
pub fn is_success(response: &ApduResponse) -> bool {
    response.status_code == SW_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty_payload() {
        let cmd = ApduCommand::new(0xE0, 0x01, 0x00, 0x00);
        assert_eq!(cmd.encode().unwrap(), vec![0xE0, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_with_payload() {
        let cmd = ApduCommand::new(0xE0, 0xD8, 0x00, 0x00).with_data(b"Bitcoin".to_vec());
        let frame = cmd.encode().unwrap();
        assert_eq!(&frame[..5], &[0xE0, 0xD8, 0x00, 0x00, 7]);
        assert_eq!(&frame[5..], b"Bitcoin");
        // Deterministic
        assert_eq!(frame, cmd.encode().unwrap());
    }

    #[test]
    fn test_encode_payload_limit() {
        let max = ApduCommand::new(0xE0, 0x02, 0, 0).with_data(vec![0xAA; 255]);
        let frame = max.encode().unwrap();
        assert_eq!(frame.len(), 260);
        assert_eq!(frame[4], 0xFF);

        let too_big = ApduCommand::new(0xE0, 0x02, 0, 0).with_data(vec![0xAA; 256]);
        let err = too_big.encode().unwrap_err();
        assert!(err.is_encoding());
        assert!(matches!(err, ApduError::Encoding { len: 256, max: 255 }));
    }

    #[test]
    fn test_decode_success() {
        let resp = ApduResponse::decode(&[0x90, 0x00]).unwrap();
        assert!(resp.data.is_empty());
        assert_eq!(resp.status_code, 0x9000);
        assert!(resp.is_success());
    }

    #[test]
    fn test_decode_status_only_failure() {
        let resp = ApduResponse::decode(&[0x6A, 0x82]).unwrap();
        assert!(resp.data.is_empty());
        assert_eq!(resp.status_code, 0x6A82);
        assert!(!is_success(&resp));
        assert_eq!(resp.status_word(), StatusWord::NotFound);
    }

    #[test]
    fn test_decode_data_and_status() {
        let resp = ApduResponse::decode(&[0x01, 0x02, 0x03, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data, vec![0x01, 0x02, 0x03]);
        assert_eq!(resp.status_code, 0x9000);
        assert_eq!(resp.to_bytes(), vec![0x01, 0x02, 0x03, 0x90, 0x00]);
    }

    #[test]
    fn test_decode_too_short() {
        for raw in [&[][..], &[0x90][..]] {
            let err = ApduResponse::decode(raw).unwrap_err();
            assert!(err.is_decoding());
            assert!(matches!(err, ApduError::ResponseTooShort { .. }));
        }
    }

    #[test]
    fn test_is_success_only_for_9000() {
        for code in 0..=u16::MAX {
            let resp = ApduResponse::decode(&code.to_be_bytes()).unwrap();
            assert_eq!(is_success(&resp), code == 0x9000, "{code:04X}");
        }
    }
}
