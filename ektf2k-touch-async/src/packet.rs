//! Decoding of the 12-byte frames the controller sends on every ready event.

use heapless::Vec;

use crate::error::ProtocolError;

/// Bytes read per ready event.
pub const FRAME_LEN: usize = 12;
/// Largest number of fingers any layout can carry.
pub const MAX_FINGERS: usize = 10;

const MARKER_TEN_FINGERS: u8 = 0x62;
const MARKER_FIVE_FINGERS: u8 = 0x5D;
const MARKER_FIVE_FINGERS_MTK: u8 = 0x6D;
const MARKER_TWO_FINGERS: u8 = 0x5A;
const MARKER_RESET: u8 = 0x55;
const MARKER_CALIBRATION: u8 = 0x66;
const MARKER_STATUS: u8 = 0x78;

const COORD_LEN: usize = 3;

/// The finger-slot layouts, selected by the frame marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerLayout {
    Ten,
    Five,
    Two,
}

impl FingerLayout {
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            MARKER_TEN_FINGERS => Some(Self::Ten),
            MARKER_FIVE_FINGERS | MARKER_FIVE_FINGERS_MTK => Some(Self::Five),
            MARKER_TWO_FINGERS => Some(Self::Two),
            _ => None,
        }
    }

    /// Number of finger slots the layout defines.
    pub fn capacity(self) -> usize {
        match self {
            Self::Ten => 10,
            Self::Five => 5,
            Self::Two => 2,
        }
    }

    fn presence_bits(self, frame: &[u8; FRAME_LEN]) -> u16 {
        match self {
            Self::Ten => (((frame[2] & 0x30) as u16) << 4) | frame[1] as u16,
            Self::Five => (frame[1] >> 3) as u16,
            Self::Two => (frame[7] & 0x03) as u16,
        }
    }

    fn first_coordinate(self) -> usize {
        match self {
            Self::Ten => 3,
            Self::Five => 2,
            Self::Two => 1,
        }
    }
}

/// A width and height in points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// A contact in display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchPoint {
    pub x: u16,
    pub y: u16,
}

/// The contacts of one frame, in slot order. Empty means no contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchReport {
    points: Vec<TouchPoint, MAX_FINGERS>,
}

impl TouchReport {
    pub fn points(&self) -> &[TouchPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Finger positions.
    Touch(TouchReport),
    /// The controller's watchdog reset it. Configuration must be reapplied.
    WatchdogReset,
    /// A reset marker without the watchdog payload.
    ResetHint,
    /// Acknowledgement of a calibration request.
    CalibrationAck,
    /// No-op status frame.
    Status,
}

/// Decodes `frame`, scaling finger positions from `sensor` to `display`
/// coordinates.
///
/// Slots whose coordinates do not fit in the frame are skipped. Points that
/// scale onto or beyond the display edge are dropped.
pub fn decode(
    frame: &[u8; FRAME_LEN],
    sensor: Resolution,
    display: Resolution,
) -> Result<Frame, ProtocolError> {
    let marker = frame[0];
    if let Some(layout) = FingerLayout::from_marker(marker) {
        return Ok(Frame::Touch(decode_touch(layout, frame, sensor, display)));
    }

    let payload = [frame[1], frame[2], frame[3]];
    match marker {
        MARKER_RESET if payload == [MARKER_RESET; 3] => Ok(Frame::WatchdogReset),
        MARKER_RESET => Ok(Frame::ResetHint),
        MARKER_CALIBRATION if payload == [MARKER_CALIBRATION; 3] => Ok(Frame::CalibrationAck),
        MARKER_STATUS => Ok(Frame::Status),
        _ => Err(ProtocolError::UnknownMarker(marker)),
    }
}

fn decode_touch(
    layout: FingerLayout,
    frame: &[u8; FRAME_LEN],
    sensor: Resolution,
    display: Resolution,
) -> TouchReport {
    let mut report = TouchReport::default();
    if sensor.width == 0 || sensor.height == 0 {
        log::warn!("ektf2k::decode sensor resolution unknown, dropping frame");
        return report;
    }

    let mut bits = layout.presence_bits(frame);
    let mut cursor = layout.first_coordinate();
    for _ in 0..layout.capacity() {
        if bits & 0x01 != 0 {
            if let Some(coord) = frame.get(cursor..cursor + COORD_LEN) {
                let x = (((coord[0] & 0xF0) as u32) << 4) | coord[1] as u32;
                let y = (((coord[0] & 0x0F) as u32) << 8) | coord[2] as u32;
                let x = x * display.width as u32 / sensor.width as u32;
                let y = y * display.height as u32 / sensor.height as u32;
                if x > 0 && y > 0 && x < display.width as u32 && y < display.height as u32 {
                    // Capacity never exceeds MAX_FINGERS.
                    let _ = report.points.push(TouchPoint {
                        x: x as u16,
                        y: y as u16,
                    });
                }
            }
        }
        bits >>= 1;
        cursor += COORD_LEN;
    }
    report
}
