//! Serial link to the mount microcontroller.
//!
//! The firmware speaks 9600 8N1 over the Pi's UART. When no port is given
//! explicitly, discovery walks the usual Raspberry Pi device names and falls
//! back to any USB serial adapter.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use clap::Args;
use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info};

/// Default UART speed; must match the firmware build.
pub const DEFAULT_BAUD: u32 = 9600;

/// Blocking read timeout. The receiver loop swallows timeouts and keeps
/// polling, so this also bounds shutdown latency.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Candidate device paths, most likely first.
const PROBE_PORTS: [&str; 4] = [
    "/dev/ttyS0",
    "/dev/serial0",
    "/dev/ttyAMA0",
    "/dev/ttyUSB0",
];

#[derive(Debug, Error)]
pub enum MountError {
    #[error("no serial port found (tried /dev/ttyS0, /dev/serial0, /dev/ttyAMA0, /dev/ttyUSB*)")]
    NoPortFound,
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Byte-stream transport to the mount.
///
/// Implemented by [`SerialLink`] for real hardware and by
/// [`mock::MockLink`](crate::mock::MockLink) for tests.
pub trait MountLink: Send {
    /// Blocking read with the link's timeout. A timeout surfaces as
    /// `ErrorKind::TimedOut` (or `WouldBlock`), never as data.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole packet. Callers serialize writes so the packet hits
    /// the wire in one piece.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Discard any unread inbound bytes.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Clone the link so one handle can move into the receiver thread while
    /// the other stays with the writers.
    fn try_clone(&self) -> io::Result<Box<dyn MountLink>>;
}

/// [`MountLink`] over a real serial port.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open `path` at `baud`, 8 data bits, no parity, 1 stop bit.
    pub fn open(path: &str, baud: u32) -> Result<Self, MountError> {
        info!("Opening serial port {path} at {baud} baud (8N1)");
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| MountError::Open {
                port: path.to_string(),
                source,
            })?;
        Ok(Self { port })
    }
}

impl MountLink for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn MountLink>> {
        let port = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialLink { port }))
    }
}

/// Find the most likely mount serial port.
pub fn discover_port() -> Result<String, MountError> {
    for candidate in PROBE_PORTS {
        if Path::new(candidate).exists() {
            debug!("Serial port probe: using {candidate}");
            return Ok(candidate.to_string());
        }
    }

    // Any USB serial adapter will do as a last resort.
    let mut usb_ports: Vec<String> = std::fs::read_dir("/dev")
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.starts_with("ttyUSB"))
                .map(|name| format!("/dev/{name}"))
                .collect()
        })
        .unwrap_or_default();
    usb_ports.sort();

    match usb_ports.into_iter().next() {
        Some(port) => {
            debug!("Serial port probe: falling back to {port}");
            Ok(port)
        }
        None => Err(MountError::NoPortFound),
    }
}

/// Command-line arguments for the mount serial connection.
///
/// Use with `#[command(flatten)]` in your CLI args struct.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Serial port path (default: auto-detect the Pi UART / USB adapter).
    #[arg(long)]
    pub port: Option<String>,

    /// Serial baud rate; must match the firmware build.
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,
}

impl LinkArgs {
    /// Open the configured port, discovering one if none was given.
    pub fn open(&self) -> Result<SerialLink, MountError> {
        let path = match &self.port {
            Some(path) => path.clone(),
            None => discover_port()?,
        };
        SerialLink::open(&path, self.baud)
    }
}
