//! In-memory firmware double for exercising the protocol engine.
//!
//! [`MockLink`] implements [`MountLink`] over shared buffers, and the paired
//! [`MockFirmware`] handle scripts the firmware side: acknowledge, drop,
//! inject telemetry, or feed raw garbage. Every frame the host sends is
//! decoded and recorded for assertions.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use wire::messages::{cmd, PositionReport, StatusReport};
use wire::{cobs, Frame};

use crate::link::MountLink;

/// How long a [`MockLink::read`] blocks before reporting a timeout. Short,
/// so shutdown in tests is quick.
const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Default)]
struct FirmwareState {
    /// Bytes queued for the host to read.
    to_host: VecDeque<u8>,
    /// Host bytes accumulated until a delimiter.
    rx_accum: Vec<u8>,
    /// Zero bytes seen outside any frame (the reset handshake).
    bare_zeros: usize,
    /// Every frame the host sent, decoded, in order.
    received: Vec<Frame>,
    /// Reply to ACK-eligible commands automatically.
    auto_ack: bool,
    /// Number of upcoming ACK-eligible commands to silently drop.
    drop_next: usize,
    /// Message ID counter for firmware-originated frames.
    next_id: u8,
}

struct Shared {
    state: Mutex<FirmwareState>,
    /// Signalled when `to_host` gains bytes.
    readable: Condvar,
    /// Signalled when `received` gains frames.
    activity: Condvar,
}

/// Test-side handle that plays the firmware.
#[derive(Clone)]
pub struct MockFirmware {
    shared: Arc<Shared>,
}

/// Host-side [`MountLink`] backed by [`MockFirmware`].
pub struct MockLink {
    shared: Arc<Shared>,
}

/// Create a connected firmware/link pair. Auto-ACK starts enabled.
pub fn pair() -> (MockFirmware, MockLink) {
    let shared = Arc::new(Shared {
        state: Mutex::new(FirmwareState {
            auto_ack: true,
            next_id: 0,
            ..FirmwareState::default()
        }),
        readable: Condvar::new(),
        activity: Condvar::new(),
    });
    (
        MockFirmware {
            shared: Arc::clone(&shared),
        },
        MockLink { shared },
    )
}

impl MockFirmware {
    /// Enable or disable automatic acknowledgement of host commands.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.state.lock().unwrap().auto_ack = enabled;
    }

    /// Silently drop the next `count` ACK-eligible host commands.
    pub fn drop_next(&self, count: usize) {
        self.shared.state.lock().unwrap().drop_next = count;
    }

    /// Snapshot of every frame the host has sent so far.
    pub fn received(&self) -> Vec<Frame> {
        self.shared.state.lock().unwrap().received.clone()
    }

    /// Frames the host sent with the given message type.
    pub fn received_with_cmd(&self, cmd_byte: u8) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.cmd == cmd_byte)
            .collect()
    }

    /// Zero bytes the host wrote outside any frame (reset handshake).
    pub fn bare_zeros_seen(&self) -> usize {
        self.shared.state.lock().unwrap().bare_zeros
    }

    /// Block until the host has sent at least `count` frames.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        while state.received.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .activity
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
        true
    }

    /// Queue raw bytes for the host to read, delimiters and all.
    pub fn inject_raw(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        state.to_host.extend(bytes);
        self.shared.readable.notify_all();
    }

    /// Queue a well-formed frame; returns the firmware message ID used.
    pub fn inject_frame(&self, cmd_byte: u8, payload: Vec<u8>) -> u8 {
        let mut state = self.shared.state.lock().unwrap();
        let id = next_firmware_id(&mut state);
        let packet = Frame { cmd: cmd_byte, id, payload }.encode_wire();
        state.to_host.extend(packet);
        self.shared.readable.notify_all();
        id
    }

    /// Queue a frame with its CRC byte flipped.
    pub fn inject_corrupted_frame(&self, cmd_byte: u8, payload: Vec<u8>) -> u8 {
        let mut state = self.shared.state.lock().unwrap();
        let id = next_firmware_id(&mut state);
        let mut raw = Frame { cmd: cmd_byte, id, payload }.encode_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let mut packet = cobs::encode(&raw);
        packet.push(0x00);
        state.to_host.extend(packet);
        self.shared.readable.notify_all();
        id
    }

    /// Acknowledge a specific host message ID.
    pub fn ack(&self, host_id: u8) {
        self.inject_frame(cmd::ACK, vec![host_id]);
    }

    /// Emit a status event; returns the firmware message ID.
    pub fn inject_status(&self, status: &StatusReport) -> u8 {
        self.inject_frame(cmd::EVT_STATUS, status.encode())
    }

    /// Emit a position event; returns the firmware message ID.
    pub fn inject_position(&self, position: &PositionReport) -> u8 {
        self.inject_frame(cmd::EVT_POSITION, position.encode())
    }

    /// Emit a reference-lost event; returns the firmware message ID.
    pub fn inject_reference_lost(&self) -> u8 {
        self.inject_frame(cmd::EVT_REF_LOST, Vec::new())
    }
}

/// Sequential non-zero IDs are enough for the firmware side.
fn next_firmware_id(state: &mut FirmwareState) -> u8 {
    state.next_id = match state.next_id {
        255 => 1,
        n => n + 1,
    };
    state.next_id
}

/// Process one complete host block inside the state lock.
fn process_host_block(shared: &Shared, state: &mut FirmwareState) {
    let block = std::mem::take(&mut state.rx_accum);
    let raw = match cobs::decode(&block) {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let parsed = match Frame::parse(&raw) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    let frame = parsed.frame;
    trace!(
        "Mock firmware received cmd {:#04x} id {}",
        frame.cmd,
        frame.id
    );

    let wants_ack = frame.cmd != cmd::ACK;
    let host_id = frame.id;
    state.received.push(frame);
    shared.activity.notify_all();

    if !wants_ack {
        return;
    }
    if state.drop_next > 0 {
        state.drop_next -= 1;
        trace!("Mock firmware dropping command id {host_id}");
        return;
    }
    if state.auto_ack {
        let id = next_firmware_id(state);
        let packet = Frame {
            cmd: cmd::ACK,
            id,
            payload: vec![host_id],
        }
        .encode_wire();
        state.to_host.extend(packet);
        shared.readable.notify_all();
    }
}

impl MountLink for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + MOCK_READ_TIMEOUT;
        let mut state = self.shared.state.lock().unwrap();
        while state.to_host.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(ErrorKind::TimedOut, "mock read timeout"));
            }
            let (next, _) = self
                .shared
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
        let n = buf.len().min(state.to_host.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.to_host.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        for &byte in buf {
            if byte == 0x00 {
                if state.rx_accum.is_empty() {
                    state.bare_zeros += 1;
                } else {
                    process_host_block(&self.shared, &mut state);
                }
            } else {
                state.rx_accum.push(byte);
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.shared.state.lock().unwrap().to_host.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn MountLink>> {
        Ok(Box::new(MockLink {
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_ack_echoes_host_id() {
        let (firmware, mut link) = pair();
        let packet = Frame::new(cmd::PAUSE, 0x42, vec![]).unwrap().encode_wire();
        link.write_all(&packet).unwrap();

        let received = firmware.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].cmd, cmd::PAUSE);

        // The queued reply is a valid ACK naming the host's ID.
        let mut reply = Vec::new();
        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).unwrap();
        reply.extend_from_slice(&buf[..n]);
        assert_eq!(reply.last(), Some(&0x00));
        let raw = cobs::decode(&reply[..reply.len() - 1]).unwrap();
        let parsed = Frame::parse(&raw).unwrap();
        assert_eq!(parsed.frame.cmd, cmd::ACK);
        assert_eq!(parsed.frame.payload, vec![0x42]);
    }

    #[test]
    fn test_drop_next_swallows_commands() {
        let (firmware, mut link) = pair();
        firmware.drop_next(1);
        let packet = Frame::new(cmd::STOP, 0x10, vec![]).unwrap().encode_wire();
        link.write_all(&packet).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(
            link.read(&mut buf).unwrap_err().kind(),
            ErrorKind::TimedOut
        );
        assert_eq!(firmware.received().len(), 1);
    }

    #[test]
    fn test_bare_zero_counting() {
        let (firmware, mut link) = pair();
        link.write_all(&[0x00, 0x00, 0x00]).unwrap();
        assert_eq!(firmware.bare_zeros_seen(), 3);
    }
}
