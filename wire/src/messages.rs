//! Typed command and event payloads for the mount protocol.
//!
//! All scalars are little-endian. Host-to-mount message types carry the CMD
//! prefix, mount-to-host events the EVT prefix. These values follow the
//! current firmware command table; confirm against the firmware build before
//! pairing with older units.

/// Message type bytes.
pub mod cmd {
    /// Acknowledge a received frame (payload: the acknowledged ID). With an
    /// empty payload this doubles as a ping.
    pub const ACK: u8 = 0x01;
    /// Move one axis to an absolute encoder position.
    pub const MOVE_STATIC: u8 = 0x10;
    /// Move one axis by a signed offset.
    pub const MOVE_RELATIVE: u8 = 0x11;
    /// Run all axes at fixed rates.
    pub const MOVE_LINEAR: u8 = 0x12;
    /// Track a sky target through the alignment rotation.
    pub const TRACK_CELESTIAL: u8 = 0x13;
    /// Stop all motion.
    pub const STOP: u8 = 0x20;
    /// Pause the motors.
    pub const PAUSE: u8 = 0x21;
    /// Resume the motors.
    pub const RESUME: u8 = 0x22;
    /// Request an EVT_POSITION reply.
    pub const GET_POSITIONS: u8 = 0x30;
    /// Encoder positions event (mount to host).
    pub const EVT_POSITION: u8 = 0x40;
    /// Telemetry event (mount to host).
    pub const EVT_STATUS: u8 = 0x41;
    /// The firmware lost its position reference (mount to host).
    pub const EVT_REF_LOST: u8 = 0x42;
}

/// Mount axes. X is altitude, Y is roll, Z is azimuth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            _ => None,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// Payload for [`cmd::MOVE_STATIC`]: axis byte plus absolute arcseconds.
pub fn move_static(axis: Axis, position_arcsec: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(axis as u8);
    payload.extend_from_slice(&position_arcsec.to_le_bytes());
    payload
}

/// Payload for [`cmd::MOVE_RELATIVE`]: axis byte plus signed arcsecond delta.
pub fn move_relative(axis: Axis, delta_arcsec: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(axis as u8);
    payload.extend_from_slice(&delta_arcsec.to_le_bytes());
    payload
}

/// Payload for [`cmd::MOVE_LINEAR`]: per-axis rates in arcsec/s.
pub fn move_linear(x_rate: f32, y_rate: f32, z_rate: f32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&x_rate.to_le_bytes());
    payload.extend_from_slice(&y_rate.to_le_bytes());
    payload.extend_from_slice(&z_rate.to_le_bytes());
    payload
}

/// Payload for [`cmd::TRACK_CELESTIAL`] (56 bytes): target RA (hours) and Dec
/// (degrees), the sky-to-mount rotation row-major, the reference epoch as
/// unix seconds, and the observer latitude in degrees.
pub fn track_celestial(
    ra_hours: f32,
    dec_deg: f32,
    rotation_row_major: &[f32; 9],
    ref_time_unix_s: u64,
    latitude_deg: f32,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(56);
    payload.extend_from_slice(&ra_hours.to_le_bytes());
    payload.extend_from_slice(&dec_deg.to_le_bytes());
    for element in rotation_row_major {
        payload.extend_from_slice(&element.to_le_bytes());
    }
    payload.extend_from_slice(&ref_time_unix_s.to_le_bytes());
    payload.extend_from_slice(&latitude_deg.to_le_bytes());
    payload
}

/// Encoder positions carried by [`cmd::EVT_POSITION`], arcseconds per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionReport {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl PositionReport {
    pub const WIRE_LEN: usize = 12;

    /// Parse the event payload. Trailing extra bytes are tolerated, the same
    /// way frame lengths are.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            x: i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            y: i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            z: i32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_LEN);
        payload.extend_from_slice(&self.x.to_le_bytes());
        payload.extend_from_slice(&self.y.to_le_bytes());
        payload.extend_from_slice(&self.z.to_le_bytes());
        payload
    }
}

/// Telemetry carried by [`cmd::EVT_STATUS`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub temp_c: f32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub enabled: bool,
    pub paused: bool,
    pub celestial_tracking: bool,
    pub fan_pct: u8,
}

impl StatusReport {
    pub const WIRE_LEN: usize = 20;

    /// Parse the event payload; trailing extra bytes are tolerated.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            temp_c: f32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            x: i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            y: i32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            z: i32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            enabled: data[16] != 0,
            paused: data[17] != 0,
            celestial_tracking: data[18] != 0,
            fan_pct: data[19],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_LEN);
        payload.extend_from_slice(&self.temp_c.to_le_bytes());
        payload.extend_from_slice(&self.x.to_le_bytes());
        payload.extend_from_slice(&self.y.to_le_bytes());
        payload.extend_from_slice(&self.z.to_le_bytes());
        payload.push(self.enabled as u8);
        payload.push(self.paused as u8);
        payload.push(self.celestial_tracking as u8);
        payload.push(self.fan_pct);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_static_layout() {
        let payload = move_static(Axis::Z, -1);
        assert_eq!(payload, [0x02, 0xFF, 0xFF, 0xFF, 0xFF]);

        let payload = move_static(Axis::X, 324_000);
        assert_eq!(payload[0], 0x00);
        assert_eq!(&payload[1..], 324_000i32.to_le_bytes());
    }

    #[test]
    fn test_move_linear_layout() {
        let payload = move_linear(15.041, 0.0, -7.5);
        assert_eq!(payload.len(), 12);
        assert_eq!(&payload[0..4], 15.041f32.to_le_bytes());
        assert_eq!(&payload[8..12], (-7.5f32).to_le_bytes());
    }

    #[test]
    fn test_track_celestial_layout() {
        let rotation = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0f32];
        let payload = track_celestial(6.0, 30.0, &rotation, 1_700_000_000, 52.5);
        assert_eq!(payload.len(), 56);
        assert_eq!(&payload[0..4], 6.0f32.to_le_bytes());
        assert_eq!(&payload[4..8], 30.0f32.to_le_bytes());
        assert_eq!(&payload[8..12], 1.0f32.to_le_bytes());
        assert_eq!(&payload[40..44], 1.0f32.to_le_bytes());
        assert_eq!(&payload[44..52], 1_700_000_000u64.to_le_bytes());
        assert_eq!(&payload[52..56], 52.5f32.to_le_bytes());
    }

    #[test]
    fn test_status_roundtrip() {
        let status = StatusReport {
            temp_c: 25.5,
            x: 100,
            y: 200,
            z: 300,
            enabled: true,
            paused: false,
            celestial_tracking: true,
            fan_pct: 50,
        };
        let encoded = status.encode();
        assert_eq!(encoded.len(), StatusReport::WIRE_LEN);
        assert_eq!(StatusReport::parse(&encoded), Some(status));
    }

    #[test]
    fn test_status_tolerates_trailing_bytes() {
        let status = StatusReport {
            temp_c: -4.0,
            x: 0,
            y: 0,
            z: 0,
            enabled: false,
            paused: true,
            celestial_tracking: false,
            fan_pct: 0,
        };
        let mut encoded = status.encode();
        encoded.extend_from_slice(&[0xDE, 0xAD]);
        assert_eq!(StatusReport::parse(&encoded), Some(status));
    }

    #[test]
    fn test_position_short_payload_rejected() {
        assert_eq!(PositionReport::parse(&[0u8; 11]), None);
    }

    #[test]
    fn test_position_roundtrip() {
        let report = PositionReport {
            x: -3600,
            y: 0,
            z: 648_000,
        };
        assert_eq!(PositionReport::parse(&report.encode()), Some(report));
    }

    #[test]
    fn test_axis_codes() {
        assert_eq!(Axis::from_u8(0), Some(Axis::X));
        assert_eq!(Axis::from_u8(2), Some(Axis::Z));
        assert_eq!(Axis::from_u8(3), None);
    }
}
