//! # dredge-protocol
//!
//! Wire protocol of the dredger sensor unit and the downstream relay format.
//!
//! This crate provides:
//! - Frame layout constants and a frame builder
//! - Stream reassembly of candidate frames from arbitrary reads
//! - Frame validation (markers, lengths, checksum) and float decoding
//! - Channel maps from named telemetry channels to analog offsets
//! - JSON-line messages relayed to downstream clients

pub mod assembler;
pub mod channel_map;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod message;

pub use assembler::{FrameAssembler, DEFAULT_MAX_BUFFER_SIZE};
pub use channel_map::{
    ChannelMap, DEFAULT_BASE_INDEX, DEFAULT_PROFILE, RESERVED_CHANNEL_NAMES,
};
pub use decoder::{DecodedFrame, FrameDecoder};
pub use error::{ChannelMapError, ProtocolError};
pub use frame::{
    checksum, AiLengthUnit, CandidateFrame, FloatByteOrder, FrameBuilder, FrameHeader,
    END_MARKER, FRAME_HEADER_SIZE, MIN_FRAME_SIZE, POLL_COMMAND, START_MARKER,
};
pub use message::{encode_line, DecodedSample, OpenRequest, RelayNotice};

/// Default downstream listen port.
pub const DEFAULT_RELAY_PORT: u16 = 12580;
