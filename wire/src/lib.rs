//! Byte-level protocol for the mount serial link.
//!
//! Frames are `[CMD][ID][LEN][PAYLOAD...][CRC8]`, COBS-stuffed so that a
//! single `0x00` byte can delimit packets on the wire. This crate is pure
//! bytes-in/bytes-out; the serial transport and the request/ACK engine live
//! in the `mount` crate.
//!
//! The camera live-view TCP framing ([`liveview`]) is also defined here, next
//! to the mount protocol, precisely so the two framings are never confused:
//! they share nothing beyond both being byte streams.

pub mod cobs;
pub mod crc8;
mod frame;
pub mod liveview;
pub mod messages;

pub use frame::{
    Frame, FrameError, ParsedFrame, HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, MAX_PENDING_BYTES,
    OVERHEAD,
};
