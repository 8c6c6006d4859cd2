//! Camera live-view TCP framing.
//!
//! The camera forwarder streams `[u8 type][u32 big-endian length][payload]`
//! messages over its own TCP channel. This framing is completely independent
//! of the mount serial protocol; it lives here so the two are documented side
//! by side and never mixed up.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message type bytes on the live-view stream.
pub mod msg_type {
    /// JSON camera metadata (ISO, shutter, aperture).
    pub const METADATA: u8 = 0x01;
    /// JPEG preview frame.
    pub const PREVIEW: u8 = 0x02;
    /// JSON command to the camera.
    pub const COMMAND: u8 = 0x03;
}

/// Upper bound on a single message; a JPEG preview stays well under this.
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LiveViewError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown live-view message type {0:#04x}")]
    UnknownType(u8),
    #[error("live-view message of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte limit")]
    Oversize(usize),
    #[error("live-view JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current exposure settings as reported by the camera.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraMetadata {
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub shutter: Option<String>,
    #[serde(default)]
    pub aperture: Option<String>,
}

/// A command to the camera, e.g. `{"Action": "set_iso", "Value": "800"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CameraCommand {
    pub action: String,
    pub value: String,
}

/// One framed live-view message.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveViewMessage {
    Metadata(CameraMetadata),
    Preview(Vec<u8>),
    Command(CameraCommand),
}

impl LiveViewMessage {
    /// Serialize to the wire form.
    pub fn encode(&self) -> Result<Vec<u8>, LiveViewError> {
        let (kind, payload) = match self {
            LiveViewMessage::Metadata(meta) => (msg_type::METADATA, serde_json::to_vec(meta)?),
            LiveViewMessage::Preview(jpeg) => (msg_type::PREVIEW, jpeg.clone()),
            LiveViewMessage::Command(command) => (msg_type::COMMAND, serde_json::to_vec(command)?),
        };
        let mut out = Vec::with_capacity(payload.len() + 5);
        out.push(kind);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Read one message from a stream. `UnexpectedEof` from the underlying
    /// reader signals a closed connection.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, LiveViewError> {
        let mut kind = [0u8; 1];
        reader.read_exact(&mut kind)?;
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(LiveViewError::Oversize(len));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        match kind[0] {
            msg_type::METADATA => Ok(LiveViewMessage::Metadata(serde_json::from_slice(&payload)?)),
            msg_type::PREVIEW => Ok(LiveViewMessage::Preview(payload)),
            msg_type::COMMAND => Ok(LiveViewMessage::Command(serde_json::from_slice(&payload)?)),
            other => Err(LiveViewError::UnknownType(other)),
        }
    }
}
