//! Length-prefixed telegram framing
//!
//! Hubs on the framed serial and RFCOMM links speak in telegrams: a 2-byte
//! little-endian length header followed by exactly `length` payload bytes.
//! Telegrams are forwarded to clients verbatim, header included, since the
//! client runs its own parser over the same framing.

pub mod describe;
pub mod framer;

pub use framer::{ByteSource, Decoded, Framer, FramerSettings};

use thiserror::Error;

/// Size of the little-endian length header.
pub const HEADER_LEN: usize = 2;

/// Longest payload accepted from the NXT family. Other hubs may differ, so
/// decoding takes the bound from [`FramerSettings`] instead.
pub const DEFAULT_MAX_LENGTH: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TelegramError {
    #[error("Telegram is shorter than its header ({0} bytes)")]
    Truncated(usize),

    #[error("Header announces {announced} payload bytes but {actual} follow")]
    LengthMismatch { announced: usize, actual: usize },

    #[error("Telegram payload is empty")]
    Empty,

    #[error("Payload of {0} bytes cannot be described by a 2-byte header")]
    TooLong(usize),
}

/// Build the length header for a payload of `length` bytes.
///
/// Lengths beyond `u16::MAX` saturate; [`Telegram::frame`] rejects them
/// before they get here.
pub fn encode_header(length: usize) -> [u8; HEADER_LEN] {
    u16::try_from(length).unwrap_or(u16::MAX).to_le_bytes()
}

/// Read the payload length out of a header.
pub fn header_length(header: [u8; HEADER_LEN]) -> usize {
    usize::from(header[0]) | (usize::from(header[1]) << 8)
}

/// Outbound path: a client-submitted blob already carries its own header,
/// so it goes to the hub untouched.
pub fn encode(blob: Vec<u8>) -> Vec<u8> {
    blob
}

/// One complete telegram, header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram(Vec<u8>);

impl Telegram {
    /// Frame a bare payload by prepending its header.
    pub fn frame(payload: &[u8]) -> Result<Self, TelegramError> {
        if payload.is_empty() {
            return Err(TelegramError::Empty);
        }
        if payload.len() > usize::from(u16::MAX) {
            return Err(TelegramError::TooLong(payload.len()));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&encode_header(payload.len()));
        bytes.extend_from_slice(payload);
        Ok(Self(bytes))
    }

    /// Wrap bytes captured off the wire, checking that the header agrees
    /// with the payload that follows it.
    pub fn from_wire(bytes: Vec<u8>) -> Result<Self, TelegramError> {
        if bytes.len() < HEADER_LEN {
            return Err(TelegramError::Truncated(bytes.len()));
        }
        let announced = header_length([bytes[0], bytes[1]]);
        let actual = bytes.len() - HEADER_LEN;
        if announced != actual {
            return Err(TelegramError::LengthMismatch { announced, actual });
        }
        if announced == 0 {
            return Err(TelegramError::Empty);
        }
        Ok(Self(bytes))
    }

    /// Length announced by the header.
    pub fn announced_length(&self) -> usize {
        header_length([self.0[0], self.0[1]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Telegram {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_request_framing() {
        let telegram = Telegram::frame(&[0x00, 0x0B]).unwrap();
        assert_eq!(telegram.as_bytes(), &[0x02, 0x00, 0x00, 0x0B]);
        assert_eq!(telegram.announced_length(), 2);
        assert_eq!(telegram.payload(), &[0x00, 0x0B]);
    }

    #[test]
    fn test_header_is_little_endian() {
        assert_eq!(encode_header(0x0102), [0x02, 0x01]);
        assert_eq!(header_length([0xFF, 0xFF]), 65535);
        assert_eq!(header_length(encode_header(256)), 256);
    }

    #[test]
    fn test_from_wire_validates_header() {
        assert!(Telegram::from_wire(vec![0x02, 0x00, 0x00, 0x0B]).is_ok());
        assert_eq!(
            Telegram::from_wire(vec![0x03, 0x00, 0x00, 0x0B]),
            Err(TelegramError::LengthMismatch { announced: 3, actual: 2 })
        );
        assert_eq!(Telegram::from_wire(vec![0x01]), Err(TelegramError::Truncated(1)));
        assert_eq!(Telegram::from_wire(vec![0x00, 0x00]), Err(TelegramError::Empty));
    }

    #[test]
    fn test_outbound_encoding_is_passthrough() {
        let blob = vec![0x0D, 0x00, 0x80, 0x04, 0x00, 0x64];
        assert_eq!(encode(blob.clone()), blob);
    }

    #[test]
    fn test_frame_rejects_empty_payload() {
        assert_eq!(Telegram::frame(&[]), Err(TelegramError::Empty));
    }
}
