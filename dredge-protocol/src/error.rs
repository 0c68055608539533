//! Protocol error types.

use thiserror::Error;

/// Errors raised while assembling or decoding sensor frames.
///
/// Every variant except [`ProtocolError::FrameTooLong`] describes a single
/// malformed frame: the frame is dropped and the stream continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too long: {size} bytes buffered without an end marker (max {max})")]
    FrameTooLong { size: usize, max: usize },

    #[error("frame too short: {len} bytes (min {min})")]
    TooShort { len: usize, min: usize },

    #[error("invalid start marker: {0:02x?}")]
    BadStartMarker([u8; 2]),

    #[error("invalid end marker: {0:02x?}")]
    BadEndMarker([u8; 2]),

    #[error("length mismatch: header declares {expected} bytes, frame has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("analog section of {len} bytes is not a whole number of floats")]
    MisalignedAnalog { len: usize },

    #[error("checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("insufficient channels: frame carries {available} analog points, channel map needs {required}")]
    InsufficientChannels { available: usize, required: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns whether the error only invalidates the current frame.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProtocolError::FrameTooLong { .. } | ProtocolError::Json(_))
    }

    /// Stable short label, used for metrics and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLong { .. } => "frame_too_long",
            ProtocolError::TooShort { .. } => "too_short",
            ProtocolError::BadStartMarker(_) => "bad_start_marker",
            ProtocolError::BadEndMarker(_) => "bad_end_marker",
            ProtocolError::LengthMismatch { .. } => "length_mismatch",
            ProtocolError::MisalignedAnalog { .. } => "misaligned_analog",
            ProtocolError::ChecksumMismatch { .. } => "checksum_mismatch",
            ProtocolError::InsufficientChannels { .. } => "insufficient_channels",
            ProtocolError::Json(_) => "json",
        }
    }
}

/// Errors raised while building a [`ChannelMap`](crate::ChannelMap).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelMapError {
    #[error("channel map has no channels")]
    Empty,

    #[error("channel name must not be empty")]
    EmptyName,

    #[error("channel '{name}' index {index} is below base index {base}")]
    IndexBelowBase { name: String, index: u32, base: u32 },

    #[error("duplicate channel name: {0}")]
    DuplicateName(String),

    #[error("channel name '{0}' is reserved for sample fields")]
    ReservedName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProtocolError::TooShort { len: 3, min: 20 }.is_transient());
        assert!(ProtocolError::BadStartMarker([0, 0]).is_transient());
        assert!(ProtocolError::ChecksumMismatch {
            expected: 0x0100,
            actual: 0x0101
        }
        .is_transient());
        assert!(ProtocolError::InsufficientChannels {
            available: 1,
            required: 2
        }
        .is_transient());

        assert!(!ProtocolError::FrameTooLong { size: 10, max: 5 }.is_transient());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0x01ab,
            actual: 0x01cd,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x01ab"));
        assert!(msg.contains("0x01cd"));

        let err = ProtocolError::BadStartMarker([0x41, 0x02]);
        assert!(err.to_string().contains("41"));

        let err = ProtocolError::LengthMismatch {
            expected: 28,
            actual: 24,
        };
        assert!(err.to_string().contains("28"));

        let err = ProtocolError::FrameTooLong {
            size: 70000,
            max: 65536,
        };
        assert!(err.to_string().contains("65536"));
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            ProtocolError::MisalignedAnalog { len: 7 }.reason(),
            "misaligned_analog"
        );
        assert_eq!(
            ProtocolError::BadEndMarker([0x0d, 0x0d]).reason(),
            "bad_end_marker"
        );
    }

    #[test]
    fn test_channel_map_error_display() {
        let err = ChannelMapError::IndexBelowBase {
            name: "density".to_string(),
            index: 10,
            base: 327,
        };
        let msg = err.to_string();
        assert!(msg.contains("density"));
        assert!(msg.contains("327"));
    }
}
