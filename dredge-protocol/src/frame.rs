//! Binary frame format of the sensor unit.
//!
//! Frame layout (16 bytes header + DI section + AI section + 4 bytes trailer):
//!
//! ```text
//! +--------+----------+--------+--------+
//! | start  | reserved | di_len | ai_len |
//! | 40 01  | 10 bytes |BE u16  |BE u16  |
//! +--------+----------+--------+--------+-------------+--------+
//! | DI data        | AI data (f32 each)  | checksum    | end    |
//! | di_len bytes   | see AiLengthUnit    | 01, sum&ff  | 0D 0A  |
//! +----------------+---------------------+-------------+--------+
//! ```
//!
//! The checksum low byte is the sum of every byte before the checksum field,
//! modulo 256. The high byte is always `0x01`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Marker opening every frame.
pub const START_MARKER: [u8; 2] = [0x40, 0x01];

/// Marker closing every frame.
pub const END_MARKER: [u8; 2] = [0x0D, 0x0A];

/// Command that makes the sensor emit one frame.
pub const POLL_COMMAND: [u8; 6] = [0x40, 0xFF, 0x00, 0x00, 0x0D, 0x0A];

/// Size of the fixed frame header in bytes (2+10+2+2 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Size of the checksum field.
pub const CHECKSUM_SIZE: usize = 2;

/// High byte of every checksum field.
pub const CHECKSUM_HIGH_BYTE: u8 = 0x01;

/// Smallest legal frame: header, empty body, checksum and end marker.
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + CHECKSUM_SIZE + END_MARKER.len();

/// Size of one analog point.
pub const ANALOG_POINT_SIZE: usize = 4;

/// How the `ai_len` header field is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiLengthUnit {
    /// `ai_len` is the byte length of the analog section.
    #[default]
    Bytes,
    /// `ai_len` is the number of analog points (4 bytes each).
    Points,
}

impl AiLengthUnit {
    /// Returns the byte length of the analog section for a header value.
    pub fn section_bytes(self, ai_len: u16) -> usize {
        match self {
            AiLengthUnit::Bytes => ai_len as usize,
            AiLengthUnit::Points => ai_len as usize * ANALOG_POINT_SIZE,
        }
    }

    /// Returns the header value describing `points` analog points.
    pub fn header_value(self, points: usize) -> usize {
        match self {
            AiLengthUnit::Bytes => points * ANALOG_POINT_SIZE,
            AiLengthUnit::Points => points,
        }
    }
}

/// Byte order of the analog floats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatByteOrder {
    #[default]
    Little,
    Big,
}

impl FloatByteOrder {
    pub fn read_f32(self, bytes: [u8; 4]) -> f32 {
        match self {
            FloatByteOrder::Little => f32::from_le_bytes(bytes),
            FloatByteOrder::Big => f32::from_be_bytes(bytes),
        }
    }

    pub fn write_f32(self, value: f32) -> [u8; 4] {
        match self {
            FloatByteOrder::Little => value.to_le_bytes(),
            FloatByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// Fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Byte length of the digital-input section.
    pub di_len: u16,
    /// Raw analog length field; see [`AiLengthUnit`].
    pub ai_len: u16,
}

impl FrameHeader {
    /// Reads the header from the first [`FRAME_HEADER_SIZE`] bytes.
    ///
    /// Returns `None` if fewer bytes are available. Markers are not checked.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            di_len: u16::from_be_bytes([buf[12], buf[13]]),
            ai_len: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }

    /// Total frame length implied by this header.
    pub fn frame_len(&self, unit: AiLengthUnit) -> usize {
        FRAME_HEADER_SIZE
            + self.di_len as usize
            + unit.section_bytes(self.ai_len)
            + CHECKSUM_SIZE
            + END_MARKER.len()
    }
}

/// A byte span from a start marker through the following end marker.
///
/// Candidates are produced by the assembler and have not been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFrame {
    bytes: Bytes,
}

impl CandidateFrame {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl From<Vec<u8>> for CandidateFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(Bytes::from(bytes))
    }
}

/// Computes the checksum field for the bytes preceding it.
pub fn checksum(data: &[u8]) -> u16 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    u16::from_be_bytes([CHECKSUM_HIGH_BYTE, sum])
}

/// Builds well-formed frames, the way the sensor unit emits them.
///
/// Used by the synthetic sensor in tests and by the benchmarks.
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder {
    digital: Vec<u8>,
    analog: Vec<f32>,
    unit: AiLengthUnit,
    order: FloatByteOrder,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digital(mut self, digital: impl Into<Vec<u8>>) -> Self {
        self.digital = digital.into();
        self
    }

    pub fn with_analog(mut self, analog: impl Into<Vec<f32>>) -> Self {
        self.analog = analog.into();
        self
    }

    pub fn with_ai_length_unit(mut self, unit: AiLengthUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_byte_order(mut self, order: FloatByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Encodes the frame into bytes.
    ///
    /// # Panics
    ///
    /// Panics if a section length does not fit the 16-bit header fields.
    pub fn encode(&self) -> BytesMut {
        let di_len = u16::try_from(self.digital.len()).expect("DI section exceeds u16");
        let ai_len = u16::try_from(self.unit.header_value(self.analog.len()))
            .expect("AI section exceeds u16");

        let header = FrameHeader { di_len, ai_len };
        let mut buf = BytesMut::with_capacity(header.frame_len(self.unit));

        buf.put_slice(&START_MARKER);
        buf.put_bytes(0, 10);
        buf.put_u16(di_len);
        buf.put_u16(ai_len);
        buf.put_slice(&self.digital);
        for value in &self.analog {
            buf.put_slice(&self.order.write_f32(*value));
        }

        let sum = checksum(&buf);
        buf.put_u16(sum);
        buf.put_slice(&END_MARKER);
        buf
    }
}
