//! Mount frame build and parse.
//!
//! Raw frame layout, before byte stuffing:
//!
//! | offset      | field   | size |
//! |-------------|---------|------|
//! | 0           | CMD     | 1    |
//! | 1           | ID      | 1    |
//! | 2           | LEN     | 1    |
//! | 3..3+LEN    | PAYLOAD | LEN  |
//! | 3+LEN       | CRC8    | 1    |
//!
//! On the wire a frame is the COBS encoding of the raw bytes followed by a
//! single `0x00` delimiter.

use thiserror::Error;

use crate::cobs;
use crate::crc8::crc8;

/// CMD + ID + LEN header bytes.
pub const HEADER_LEN: usize = 3;
/// Header plus the trailing CRC byte.
pub const OVERHEAD: usize = 4;
/// Largest payload the firmware accepts.
pub const MAX_PAYLOAD_LEN: usize = 60;
/// Largest raw frame (header + payload + CRC).
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + OVERHEAD;
/// Receiver bound: an accumulation this large with no delimiter is garbage.
pub const MAX_PENDING_BYTES: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("payload too long: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLong(usize),
    #[error("message ID 0x00 is reserved")]
    InvalidId,
    #[error("CRC mismatch: computed {expected:#04x}, received {got:#04x}")]
    CrcMismatch { expected: u8, got: u8 },
}

/// A link-layer frame: message type, correlation ID and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

/// A received frame plus how leniently it had to be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub frame: Frame,
    /// The declared LEN disagreed with the block size, so the payload length
    /// was re-derived from the block size. Some firmware builds append fields
    /// without bumping LEN; callers should log this prominently.
    pub len_rederived: bool,
}

impl Frame {
    /// Build a frame, validating the ID and payload length invariants.
    pub fn new(cmd: u8, id: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if id == 0 {
            return Err(FrameError::InvalidId);
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self { cmd, id, payload })
    }

    /// Raw (unstuffed) frame bytes: header, payload, CRC.
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.payload.len() + OVERHEAD);
        raw.push(self.cmd);
        raw.push(self.id);
        raw.push(self.payload.len() as u8);
        raw.extend_from_slice(&self.payload);
        raw.push(crc8(&raw));
        raw
    }

    /// Wire form: COBS-encoded raw frame plus the `0x00` delimiter.
    pub fn encode_wire(&self) -> Vec<u8> {
        let mut packet = cobs::encode(&self.encode_raw());
        packet.push(0x00);
        packet
    }

    /// Parse an unstuffed frame.
    ///
    /// Frames whose declared LEN disagrees with the block size are still
    /// accepted with the length re-derived (see [`ParsedFrame`]); CRC and ID
    /// violations are hard errors.
    pub fn parse(raw: &[u8]) -> Result<ParsedFrame, FrameError> {
        if raw.len() < OVERHEAD {
            return Err(FrameError::TooShort(raw.len()));
        }

        let declared_len = raw[2] as usize;
        let actual_len = raw.len() - OVERHEAD;
        let len_rederived = declared_len != actual_len;

        let expected = crc8(&raw[..raw.len() - 1]);
        let got = raw[raw.len() - 1];
        if expected != got {
            return Err(FrameError::CrcMismatch { expected, got });
        }

        let id = raw[1];
        if id == 0 {
            return Err(FrameError::InvalidId);
        }

        Ok(ParsedFrame {
            frame: Frame {
                cmd: raw[0],
                id,
                payload: raw[HEADER_LEN..raw.len() - 1].to_vec(),
            },
            len_rederived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_raw_layout() {
        let frame = Frame::new(0x21, 0x17, vec![]).unwrap();
        let raw = frame.encode_raw();
        assert_eq!(&raw[..3], &[0x21, 0x17, 0x00]);
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[3], crc8(&raw[..3]));
    }

    #[test]
    fn test_wire_form_has_single_trailing_delimiter() {
        let frame = Frame::new(0x10, 0x42, vec![0x00, 0x01, 0x00]).unwrap();
        let wire = frame.encode_wire();
        assert_eq!(wire.last(), Some(&0x00));
        assert!(!wire[..wire.len() - 1].contains(&0x00));
    }

    #[test]
    fn test_roundtrip_randomized() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..2000 {
            let cmd: u8 = rng.gen();
            let id: u8 = rng.gen_range(1..=255);
            let len = rng.gen_range(0..=MAX_PAYLOAD_LEN);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let frame = Frame::new(cmd, id, payload).unwrap();
            let raw = frame.encode_raw();
            let parsed = Frame::parse(&raw).unwrap();
            assert_eq!(parsed.frame, frame);
            assert!(!parsed.len_rederived);
        }
    }

    #[test]
    fn test_rejects_zero_id() {
        assert_eq!(Frame::new(0x01, 0, vec![]), Err(FrameError::InvalidId));

        let mut raw = vec![0x01, 0x00, 0x00];
        raw.push(crc8(&raw));
        assert_eq!(Frame::parse(&raw), Err(FrameError::InvalidId));
    }

    #[test]
    fn test_rejects_oversize_payload() {
        assert_eq!(
            Frame::new(0x10, 1, vec![0; MAX_PAYLOAD_LEN + 1]),
            Err(FrameError::PayloadTooLong(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_too_short() {
        assert_eq!(Frame::parse(&[0x01, 0x02, 0x00]), Err(FrameError::TooShort(3)));
    }

    #[test]
    fn test_crc_mismatch() {
        let mut raw = Frame::new(0x40, 5, vec![1, 2, 3, 4]).unwrap().encode_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        assert!(matches!(
            Frame::parse(&raw),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_len_rederived_for_unadvertised_trailing_fields() {
        // Firmware frame that declares 2 payload bytes but carries 4.
        let mut raw = vec![0x41, 0x09, 0x02, 0xAA, 0xBB, 0xCC, 0xDD];
        raw.push(crc8(&raw));

        let parsed = Frame::parse(&raw).unwrap();
        assert!(parsed.len_rederived);
        assert_eq!(parsed.frame.payload, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }
}
