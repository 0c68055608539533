//! Validation and decoding of candidate frames.

use crate::channel_map::ChannelMap;
use crate::error::ProtocolError;
use crate::frame::{
    checksum, AiLengthUnit, CandidateFrame, FloatByteOrder, FrameHeader, ANALOG_POINT_SIZE,
    CHECKSUM_SIZE, END_MARKER, FRAME_HEADER_SIZE, MIN_FRAME_SIZE, START_MARKER,
};
use crate::message::DecodedSample;
use bytes::Bytes;
use chrono::Utc;

/// A validated frame before channel mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    /// Digital-input section, passed through uninterpreted.
    pub digital: Bytes,
    /// Analog points in protocol order.
    pub analog: Vec<f32>,
}

/// Decodes candidate frames into samples using one channel map.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    channels: ChannelMap,
    unit: AiLengthUnit,
    order: FloatByteOrder,
}

impl FrameDecoder {
    pub fn new(channels: ChannelMap) -> Self {
        Self {
            channels,
            unit: AiLengthUnit::default(),
            order: FloatByteOrder::default(),
        }
    }

    pub fn with_ai_length_unit(mut self, unit: AiLengthUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_byte_order(mut self, order: FloatByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Decodes a frame into a sample stamped with the current time.
    pub fn decode(&self, frame: &CandidateFrame) -> Result<DecodedSample, ProtocolError> {
        let decoded = self.decode_frame(frame)?;
        let values = self.channels.apply(&decoded.analog)?;
        Ok(DecodedSample::new(Utc::now(), values))
    }

    /// Validates a frame and extracts its sections.
    pub fn decode_frame(&self, frame: &CandidateFrame) -> Result<DecodedFrame, ProtocolError> {
        let buf = frame.as_bytes();

        if buf.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::TooShort {
                len: buf.len(),
                min: MIN_FRAME_SIZE,
            });
        }

        let start = [buf[0], buf[1]];
        if start != START_MARKER {
            return Err(ProtocolError::BadStartMarker(start));
        }
        let end = [buf[buf.len() - 2], buf[buf.len() - 1]];
        if end != END_MARKER {
            return Err(ProtocolError::BadEndMarker(end));
        }

        let header = FrameHeader::peek(buf).ok_or(ProtocolError::TooShort {
            len: buf.len(),
            min: MIN_FRAME_SIZE,
        })?;
        let expected = header.frame_len(self.unit);
        if expected != buf.len() {
            return Err(ProtocolError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        let di_start = FRAME_HEADER_SIZE;
        let ai_start = di_start + header.di_len as usize;
        let ai_end = ai_start + self.unit.section_bytes(header.ai_len);
        let digital = Bytes::copy_from_slice(&buf[di_start..ai_start]);

        let analog_bytes = &buf[ai_start..ai_end];
        if analog_bytes.len() % ANALOG_POINT_SIZE != 0 {
            return Err(ProtocolError::MisalignedAnalog {
                len: analog_bytes.len(),
            });
        }
        let analog = analog_bytes
            .chunks_exact(ANALOG_POINT_SIZE)
            .map(|c| self.order.read_f32([c[0], c[1], c[2], c[3]]))
            .collect();

        let embedded = u16::from_be_bytes([buf[ai_end], buf[ai_end + 1]]);
        let computed = checksum(&buf[..ai_end]);
        if embedded != computed {
            return Err(ProtocolError::ChecksumMismatch {
                expected: embedded,
                actual: computed,
            });
        }
        debug_assert_eq!(ai_end + CHECKSUM_SIZE + END_MARKER.len(), buf.len());

        Ok(DecodedFrame {
            header,
            digital,
            analog,
        })
    }
}
