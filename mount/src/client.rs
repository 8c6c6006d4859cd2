//! Mount protocol engine and command façade.
//!
//! One [`MountClient`] owns the link. A background receiver thread scans the
//! byte stream for `0x00`-delimited packets, COBS-decodes them, routes ACKs
//! to the pending-command table and telemetry to subscribers, and
//! acknowledges everything else back to the firmware. Command senders block
//! on a per-command completion handle; a command that stays unacknowledged is
//! resent with the same message ID so the firmware can deduplicate.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use wire::messages::{self, cmd, Axis, PositionReport, StatusReport};
use wire::{cobs, Frame, FrameError, MAX_PENDING_BYTES, OVERHEAD};

use crate::events::{CallbackId, EventBus, MountEvent};
use crate::link::{LinkArgs, MountError, MountLink};

/// Reset handshake settle time before draining the input buffer.
const RESET_SETTLE: Duration = Duration::from_millis(100);
/// Deadline for the receiver thread to wind down on shutdown.
const SHUTDOWN_JOIN_DEADLINE: Duration = Duration::from_secs(1);
/// Back-off after a non-timeout read error before polling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Retry policy for acknowledged commands.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long each attempt waits for the firmware to acknowledge.
    pub ack_timeout: Duration,
    /// Total sends per command, first attempt included.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2000),
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no ACK for command {cmd:#04x} (id {id}) after {attempts} attempts")]
    NoAck { cmd: u8, id: u8, attempts: u32 },
    #[error("link closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Allocates message IDs: uniform in [1, 255], never equal to the previous
/// one, so consecutive packets are always distinguishable.
struct IdAllocator {
    last: u8,
    rng: SmallRng,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            last: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    fn next(&mut self) -> u8 {
        loop {
            let id: u8 = self.rng.gen_range(1..=255);
            if id != self.last {
                self.last = id;
                return id;
            }
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<u8, SyncSender<()>>>>;
type SharedLink = Arc<Mutex<Box<dyn MountLink>>>;
type SharedIds = Arc<Mutex<IdAllocator>>;

/// Handle to a connected mount. Create one per link; drop (or call
/// [`shutdown`](Self::shutdown)) to stop the receiver and close the port.
pub struct MountClient {
    writer: SharedLink,
    pending: PendingAcks,
    events: Arc<EventBus>,
    ids: SharedIds,
    config: ClientConfig,
    shutdown: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl MountClient {
    /// Open the configured serial port and connect.
    pub fn connect(args: &LinkArgs) -> Result<Self, MountError> {
        let link = args.open()?;
        Ok(Self::over_link(Box::new(link))?)
    }

    /// Take ownership of a link, run the reset handshake, and start the
    /// receiver. This is the seam tests use to swap in a mock link.
    pub fn over_link(link: Box<dyn MountLink>) -> io::Result<Self> {
        Self::over_link_with(link, ClientConfig::default())
    }

    /// [`over_link`](Self::over_link) with an explicit retry policy.
    pub fn over_link_with(mut link: Box<dyn MountLink>, config: ClientConfig) -> io::Result<Self> {
        // The firmware treats three delimiters in a row as start-of-session.
        link.write_all(&[0x00, 0x00, 0x00])?;
        thread::sleep(RESET_SETTLE);
        link.clear_input()?;

        let reader = link.try_clone()?;
        let writer: SharedLink = Arc::new(Mutex::new(link));
        let pending: PendingAcks = Arc::default();
        let events = Arc::new(EventBus::default());
        let ids: SharedIds = Arc::new(Mutex::new(IdAllocator::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let receiver = {
            let writer = Arc::clone(&writer);
            let pending = Arc::clone(&pending);
            let events = Arc::clone(&events);
            let ids = Arc::clone(&ids);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("mount-recv".to_string())
                .spawn(move || receiver_loop(reader, writer, pending, events, ids, shutdown))?
        };

        info!("Mount link established");
        Ok(Self {
            writer,
            pending,
            events,
            ids,
            config,
            shutdown,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Send a command and block until the firmware acknowledges it.
    ///
    /// All attempts reuse the same message ID; an ACK that arrives after its
    /// attempt timed out but before the next send still counts.
    pub fn send_command(&self, cmd_byte: u8, payload: &[u8]) -> Result<(), CommandError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(CommandError::Closed);
        }
        let id = self.ids.lock().unwrap().next();
        let packet = Frame::new(cmd_byte, id, payload.to_vec())?.encode_wire();

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                thread::sleep(self.config.retry_delay);
                debug!(
                    "Resending command {cmd_byte:#04x} (id {id}), attempt {attempt}/{}",
                    self.config.max_attempts
                );
            }

            let (tx, rx) = mpsc::sync_channel(1);
            self.pending.lock().unwrap().insert(id, tx);
            {
                let mut link = self.writer.lock().unwrap();
                if let Err(e) = link.write_all(&packet) {
                    self.pending.lock().unwrap().remove(&id);
                    return Err(e.into());
                }
            }
            trace!(
                "Sent command {cmd_byte:#04x} id {id} ({} payload bytes), attempt {attempt}",
                payload.len()
            );

            match rx.recv_timeout(self.config.ack_timeout) {
                Ok(()) => {
                    trace!("Command {cmd_byte:#04x} id {id} acknowledged");
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.pending.lock().unwrap().remove(&id);
                    // The ACK may have landed between the timeout and the
                    // table removal.
                    if rx.try_recv().is_ok() {
                        return Ok(());
                    }
                    warn!(
                        "No ACK for command {cmd_byte:#04x} (id {id}) within {:?}",
                        self.config.ack_timeout
                    );
                }
                Err(RecvTimeoutError::Disconnected) => return Err(CommandError::Closed),
            }
        }

        Err(CommandError::NoAck {
            cmd: cmd_byte,
            id,
            attempts: self.config.max_attempts,
        })
    }

    /// Send a packet without expecting an ACK (pings, outbound ACKs).
    pub fn send_unacknowledged(&self, cmd_byte: u8, payload: &[u8]) -> Result<(), CommandError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(CommandError::Closed);
        }
        let id = self.ids.lock().unwrap().next();
        let packet = Frame::new(cmd_byte, id, payload.to_vec())?.encode_wire();
        let mut link = self.writer.lock().unwrap();
        link.write_all(&packet)?;
        trace!("Sent unacknowledged {cmd_byte:#04x} id {id}");
        Ok(())
    }

    // ==================== Subscriptions ====================

    /// Register a callback for firmware events. Callbacks run on the
    /// receiver thread in wire order.
    pub fn subscribe(
        &self,
        callback: impl Fn(&MountEvent) + Send + Sync + 'static,
    ) -> CallbackId {
        self.events.subscribe(Arc::new(callback))
    }

    /// Remove a previously registered callback.
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        self.events.unsubscribe(id)
    }

    // ==================== Commands ====================

    /// Fire-and-forget liveness probe. No ACK is awaited; watch for the
    /// firmware's echo via the log if you need confirmation.
    pub fn ping(&self) -> Result<(), CommandError> {
        self.send_unacknowledged(cmd::ACK, &[])
    }

    /// Pause the motors, holding position.
    pub fn pause(&self) -> Result<(), CommandError> {
        self.send_command(cmd::PAUSE, &[])
    }

    /// Resume the motors after a pause.
    pub fn resume(&self) -> Result<(), CommandError> {
        self.send_command(cmd::RESUME, &[])
    }

    /// Stop all motion.
    pub fn stop(&self) -> Result<(), CommandError> {
        self.send_command(cmd::STOP, &[])
    }

    /// Request an encoder position report; the reply arrives as a
    /// [`MountEvent::Position`].
    pub fn get_positions(&self) -> Result<(), CommandError> {
        self.send_command(cmd::GET_POSITIONS, &[])
    }

    /// Move one axis to an absolute encoder position in arcseconds.
    pub fn move_static(&self, axis: Axis, position_arcsec: i32) -> Result<(), CommandError> {
        self.send_command(cmd::MOVE_STATIC, &messages::move_static(axis, position_arcsec))
    }

    /// Move one axis by a signed arcsecond offset.
    pub fn move_relative(&self, axis: Axis, delta_arcsec: i32) -> Result<(), CommandError> {
        self.send_command(
            cmd::MOVE_RELATIVE,
            &messages::move_relative(axis, delta_arcsec),
        )
    }

    /// Run all axes at fixed rates in arcsec/s.
    pub fn move_linear(
        &self,
        x_rate: f32,
        y_rate: f32,
        z_rate: f32,
    ) -> Result<(), CommandError> {
        self.send_command(cmd::MOVE_LINEAR, &messages::move_linear(x_rate, y_rate, z_rate))
    }

    /// Start firmware-side celestial tracking of `(ra_hours, dec_deg)`
    /// through the given sky-to-mount rotation, anchored at `ref_time_unix_s`.
    pub fn track_celestial(
        &self,
        ra_hours: f32,
        dec_deg: f32,
        rotation_row_major: &[f32; 9],
        ref_time_unix_s: u64,
        latitude_deg: f32,
    ) -> Result<(), CommandError> {
        self.send_command(
            cmd::TRACK_CELESTIAL,
            &messages::track_celestial(
                ra_hours,
                dec_deg,
                rotation_row_major,
                ref_time_unix_s,
                latitude_deg,
            ),
        )
    }

    // ==================== Shutdown ====================

    /// Stop the receiver and fail any in-flight commands. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        // Dropping the completion handles wakes blocked senders with
        // `Closed`.
        self.pending.lock().unwrap().clear();

        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let deadline = Instant::now() + SHUTDOWN_JOIN_DEADLINE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Receiver thread did not stop within {SHUTDOWN_JOIN_DEADLINE:?}");
            }
        }
        debug!("Mount client shut down");
    }
}

impl Drop for MountClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background receiver: delimiter scan, decode, dispatch.
fn receiver_loop(
    mut link: Box<dyn MountLink>,
    writer: SharedLink,
    pending: PendingAcks,
    events: Arc<EventBus>,
    ids: SharedIds,
    shutdown: Arc<AtomicBool>,
) {
    let mut accum: Vec<u8> = Vec::with_capacity(MAX_PENDING_BYTES);
    let mut overflow = false;
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Relaxed) {
        let n = match link.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                warn!("Serial read error: {e}");
                thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };

        for &byte in &buf[..n] {
            if byte == 0x00 {
                if overflow {
                    // The oversized block ends here; resynchronize.
                    overflow = false;
                } else if !accum.is_empty() {
                    handle_block(&accum, &writer, &pending, &events, &ids);
                    accum.clear();
                }
                continue;
            }
            if overflow {
                continue;
            }
            accum.push(byte);
            if accum.len() > MAX_PENDING_BYTES {
                warn!(
                    "Discarding oversized receive buffer ({} bytes with no frame delimiter)",
                    accum.len()
                );
                accum.clear();
                overflow = true;
            }
        }
    }
    debug!("Receiver loop exiting");
}

/// Decode and dispatch one delimited block.
fn handle_block(
    block: &[u8],
    writer: &SharedLink,
    pending: &PendingAcks,
    events: &EventBus,
    ids: &SharedIds,
) {
    let raw = match cobs::decode(block) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("COBS decode failed on a {} byte block: {e}", block.len());
            return;
        }
    };
    if raw.len() < OVERHEAD {
        trace!("Dropping runt block ({} bytes decoded)", raw.len());
        return;
    }

    let parsed = match Frame::parse(&raw) {
        Ok(parsed) => parsed,
        Err(FrameError::CrcMismatch { expected, got }) => {
            warn!("CRC error in received frame: computed {expected:#04x}, got {got:#04x}");
            return;
        }
        Err(FrameError::InvalidId) => {
            warn!("Received frame with reserved message ID 0x00");
            return;
        }
        Err(e) => {
            warn!("Unparseable frame: {e}");
            return;
        }
    };
    if parsed.len_rederived {
        warn!(
            "Frame LEN disagrees with block size (cmd {:#04x}, id {}): payload re-derived as {} bytes",
            parsed.frame.cmd,
            parsed.frame.id,
            parsed.frame.payload.len()
        );
    }
    let frame = parsed.frame;

    if frame.cmd == cmd::ACK {
        // An ACK is never acknowledged back; that would recurse.
        match frame.payload.first() {
            Some(&acked_id) => {
                let handle = pending.lock().unwrap().remove(&acked_id);
                match handle {
                    Some(tx) => {
                        let _ = tx.send(());
                        trace!("ACK for id {acked_id}");
                    }
                    None => debug!("ACK for unknown id {acked_id} (late or duplicate)"),
                }
            }
            None => trace!("Ping echo (id {})", frame.id),
        }
        return;
    }

    // Acknowledge before dispatch so a slow subscriber cannot starve the
    // firmware's retransmit window.
    send_ack(writer, ids, frame.id);

    match frame.cmd {
        cmd::EVT_STATUS => match StatusReport::parse(&frame.payload) {
            Some(status) => events.emit(&MountEvent::Status(status)),
            None => warn!(
                "Status event with short payload ({} bytes)",
                frame.payload.len()
            ),
        },
        cmd::EVT_POSITION => match PositionReport::parse(&frame.payload) {
            Some(position) => events.emit(&MountEvent::Position(position)),
            None => warn!(
                "Position event with short payload ({} bytes)",
                frame.payload.len()
            ),
        },
        cmd::EVT_REF_LOST => {
            warn!("Firmware reports position reference lost");
            events.emit(&MountEvent::ReferenceLost);
        }
        other => debug!("Unhandled message type {other:#04x} (id {})", frame.id),
    }
}

/// Fire-and-forget acknowledgement of a received frame.
fn send_ack(writer: &SharedLink, ids: &SharedIds, acked_id: u8) {
    let id = ids.lock().unwrap().next();
    let frame = match Frame::new(cmd::ACK, id, vec![acked_id]) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("ACK frame build failed: {e}");
            return;
        }
    };
    let packet = frame.encode_wire();
    let mut link = writer.lock().unwrap();
    if let Err(e) = link.write_all(&packet) {
        warn!("Failed to send ACK for id {acked_id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_allocator_never_zero_never_adjacent_repeat() {
        let mut ids = IdAllocator::new();
        let mut last = 0u8;
        for _ in 0..10_000 {
            let id = ids.next();
            assert_ne!(id, 0);
            assert_ne!(id, last);
            last = id;
        }
    }

    #[test]
    fn test_id_allocator_covers_the_full_range() {
        let mut ids = IdAllocator::new();
        let mut seen = [false; 256];
        for _ in 0..10_000 {
            seen[ids.next() as usize] = true;
        }
        assert!(!seen[0]);
        assert!(seen[1..].iter().all(|&s| s), "allocator skipped some IDs");
    }
}
