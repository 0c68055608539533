//! Frame synchronization over an unbounded byte stream.

use crate::error::ProtocolError;
use crate::frame::{
    AiLengthUnit, CandidateFrame, FrameHeader, END_MARKER, MIN_FRAME_SIZE, START_MARKER,
};
use bytes::{Buf, BytesMut};

/// Default bound on the assembly buffer (64 KiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Splits a byte stream into candidate frames.
///
/// Bytes before a start marker are discarded. At most one unterminated
/// frame is retained between calls; if it grows past the configured maximum
/// the buffer is dropped and [`ProtocolError::FrameTooLong`] is returned.
pub struct FrameAssembler {
    buffer: BytesMut,
    unit: AiLengthUnit,
    max_buffer_size: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            unit: AiLengthUnit::default(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Sets how the header's AI length is read when locating a frame's end.
    pub fn with_ai_length_unit(mut self, unit: AiLengthUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the buffer bound. Values below the minimum frame size are raised to it.
    pub fn with_max_buffer_size(mut self, max: usize) -> Self {
        self.max_buffer_size = max.max(MIN_FRAME_SIZE);
        self
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Appends a chunk and returns every frame it completes, in stream order.
    ///
    /// Frames completed before an overflow in the same chunk are lost with
    /// the error; callers that must keep them use [`extend`](Self::extend)
    /// and [`next_frame`](Self::next_frame) directly.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<CandidateFrame>, ProtocolError> {
        self.extend(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extracts the next complete frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<CandidateFrame>, ProtocolError> {
        let start = match find(&self.buffer, &START_MARKER) {
            Some(pos) => pos,
            None => {
                // A start marker may be split across reads.
                let keep = usize::from(self.buffer.last() == Some(&START_MARKER[0]));
                let discard = self.buffer.len() - keep;
                self.buffer.advance(discard);
                return Ok(None);
            }
        };
        self.buffer.advance(start);

        if let Some(end) = self.locate_end() {
            let frame = self.buffer.split_to(end).freeze();
            return Ok(Some(CandidateFrame::new(frame)));
        }

        if self.buffer.len() > self.max_buffer_size {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(ProtocolError::FrameTooLong {
                size,
                max: self.max_buffer_size,
            });
        }

        Ok(None)
    }

    /// Finds the end (exclusive) of the frame at the head of the buffer.
    ///
    /// The header's declared length is trusted when an end marker sits
    /// exactly there, so payload bytes equal to `0D 0A` cannot cut a frame
    /// short. While the declared end is still outstanding, an end marker
    /// directly followed by the next start marker closes the frame early,
    /// so a corrupt header cannot hold back the frames behind it. Otherwise
    /// the first end marker after the start marker wins.
    fn locate_end(&self) -> Option<usize> {
        let header = FrameHeader::peek(&self.buffer)?;
        let declared = header.frame_len(self.unit);
        let body = &self.buffer[START_MARKER.len()..];

        if declared <= self.max_buffer_size {
            if self.buffer.len() < declared {
                return find_boundary(body).map(|pos| START_MARKER.len() + pos + END_MARKER.len());
            }
            if self.buffer[declared - END_MARKER.len()..declared] == END_MARKER {
                return Some(declared);
            }
        }

        find(body, &END_MARKER).map(|pos| START_MARKER.len() + pos + END_MARKER.len())
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Position of an end marker immediately followed by a start marker.
fn find_boundary(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(END_MARKER.len() + START_MARKER.len())
        .position(|w| w[..END_MARKER.len()] == END_MARKER && w[END_MARKER.len()..] == START_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use proptest::prelude::*;

    fn sample_frame(values: &[f32]) -> Vec<u8> {
        FrameBuilder::new()
            .with_digital(vec![0u8; 5])
            .with_analog(values.to_vec())
            .encode()
            .to_vec()
    }

    #[test]
    fn test_single_frame() {
        let frame = sample_frame(&[1.0, 2.0]);
        let mut assembler = FrameAssembler::new();

        let frames = assembler.feed(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let frame = sample_frame(&[1.0, 2.0, 3.0]);
        let mut assembler = FrameAssembler::new();

        assert!(assembler.feed(&frame[..10]).unwrap().is_empty());
        assert_eq!(assembler.buffered(), 10);

        assert!(assembler.feed(&frame[10..20]).unwrap().is_empty());

        let frames = assembler.feed(&frame[20..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = sample_frame(&[1.0]);
        let second = sample_frame(&[2.0, 3.0]);
        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);

        let frames = FrameAssembler::new().feed(&chunk).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_bytes(), &first[..]);
        assert_eq!(frames[1].as_bytes(), &second[..]);
    }

    #[test]
    fn test_garbage_before_start_is_discarded() {
        let frame = sample_frame(&[4.0]);
        let mut chunk = vec![0x00, 0x13, 0x0D, 0x0A, 0xFF];
        chunk.extend_from_slice(&frame);

        let frames = FrameAssembler::new().feed(&chunk).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
    }

    #[test]
    fn test_garbage_only_clears_buffer() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.feed(&[0x11, 0x22, 0x33]).unwrap().is_empty());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_start_marker_split_across_reads() {
        let frame = sample_frame(&[5.0]);
        let mut assembler = FrameAssembler::new();

        let mut first = vec![0x99, 0x98];
        first.push(frame[0]);
        assert!(assembler.feed(&first).unwrap().is_empty());
        assert_eq!(assembler.buffered(), 1);

        let frames = assembler.feed(&frame[1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
    }

    #[test]
    fn test_end_marker_inside_analog_data() {
        // 0x0A0D0A0D in little-endian puts 0D 0A inside the float bytes.
        let value = f32::from_le_bytes([0x0D, 0x0A, 0x0D, 0x0A]);
        let frame = sample_frame(&[value, 1.0]);

        let frames = FrameAssembler::new().feed(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame.len());
    }

    #[test]
    fn test_inconsistent_header_falls_back_to_end_marker() {
        let mut frame = sample_frame(&[1.0, 2.0]);
        // Declare one analog point too many.
        frame[15] += 4;
        let mut chunk = frame.clone();
        let next = sample_frame(&[3.0]);
        chunk.extend_from_slice(&next);

        let frames = FrameAssembler::new().feed(&chunk).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
        assert_eq!(frames[1].as_bytes(), &next[..]);
    }

    #[test]
    fn test_corrupt_header_does_not_hold_back_frames() {
        // Noise shaped like a header declaring 40000 DI bytes.
        let mut chunk = START_MARKER.to_vec();
        chunk.extend_from_slice(&[0u8; 10]);
        chunk.extend_from_slice(&40000u16.to_be_bytes());
        chunk.extend_from_slice(&[0x00, 0x00]);

        let frames: Vec<Vec<u8>> = (1..=5).map(|i| sample_frame(&[i as f32])).collect();
        for frame in &frames {
            chunk.extend_from_slice(frame);
        }

        let mut assembler = FrameAssembler::new();
        let emitted = assembler.feed(&chunk).unwrap();

        // The first frame is swallowed by the noise; the rest come through.
        assert_eq!(emitted.len(), 5);
        assert!(emitted[0].as_bytes().ends_with(&frames[0]));
        for (candidate, frame) in emitted[1..].iter().zip(&frames[1..]) {
            assert_eq!(candidate.as_bytes(), &frame[..]);
        }
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_declared_length_waits_without_boundary() {
        // Payload carrying 0D 0A must not end a frame split across reads.
        let value = f32::from_le_bytes([0x0D, 0x0A, 0x0D, 0x0A]);
        let frame = sample_frame(&[value, 1.0]);
        let cut = frame.len() - 6;

        let mut assembler = FrameAssembler::new();
        assert!(assembler.feed(&frame[..cut]).unwrap().is_empty());
        let frames = assembler.feed(&frame[cut..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &frame[..]);
    }

    #[test]
    fn test_unterminated_frame_too_long() {
        let mut assembler = FrameAssembler::new().with_max_buffer_size(64);

        // Header declaring far more data than the bound, no end marker.
        let mut chunk = START_MARKER.to_vec();
        chunk.extend_from_slice(&[0u8; 10]);
        chunk.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(assembler.feed(&chunk).unwrap().is_empty());

        let result = assembler.feed(&[0x55; 64]);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLong { max: 64, .. })
        ));
        assert_eq!(assembler.buffered(), 0);

        // The assembler keeps working after the overflow.
        let frame = sample_frame(&[1.0]);
        assert_eq!(assembler.feed(&frame).unwrap().len(), 1);
    }

    #[test]
    fn test_incremental_api_keeps_frames_before_overflow() {
        let frame = sample_frame(&[1.0]);
        let mut chunk = frame.clone();
        chunk.extend_from_slice(&START_MARKER);
        chunk.extend_from_slice(&[0x77; 80]);

        let mut assembler = FrameAssembler::new().with_max_buffer_size(64);
        assembler.extend(&chunk);

        let first = assembler.next_frame().unwrap().unwrap();
        assert_eq!(first.as_bytes(), &frame[..]);
        assert!(matches!(
            assembler.next_frame(),
            Err(ProtocolError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn test_max_buffer_size_floor() {
        let assembler = FrameAssembler::new().with_max_buffer_size(1);
        assert_eq!(assembler.max_buffer_size(), MIN_FRAME_SIZE);
    }

    #[test]
    fn test_points_unit() {
        let frame = FrameBuilder::new()
            .with_analog(vec![1.0, 2.0])
            .with_ai_length_unit(AiLengthUnit::Points)
            .encode();

        let frames = FrameAssembler::new()
            .with_ai_length_unit(AiLengthUnit::Points)
            .feed(&frame)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame.len());
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            values in proptest::collection::vec(any::<f32>(), 0..40),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let frame = sample_frame(&values);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(frame.len())).collect();
            points.sort_unstable();
            points.dedup();

            let mut assembler = FrameAssembler::new();
            let mut frames = Vec::new();
            let mut last = 0;
            for point in points.into_iter().chain(std::iter::once(frame.len())) {
                frames.extend(assembler.feed(&frame[last..point]).unwrap());
                last = point;
            }

            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames[0].as_bytes(), &frame[..]);
        }

        #[test]
        fn prop_garbage_prefix_is_ignored(
            garbage in proptest::collection::vec(any::<u8>(), 0..64),
            values in proptest::collection::vec(-1.0e6f32..1.0e6, 1..10),
        ) {
            // Garbage must not itself contain a start marker byte.
            let garbage: Vec<u8> = garbage.into_iter().filter(|b| *b != START_MARKER[0]).collect();
            let frame = sample_frame(&values);

            let mut chunk = garbage;
            chunk.extend_from_slice(&frame);
            chunk.extend_from_slice(&frame);

            let frames = FrameAssembler::new().feed(&chunk).unwrap();
            prop_assert_eq!(frames.len(), 2);
            prop_assert_eq!(frames[0].as_bytes(), &frame[..]);
            prop_assert_eq!(frames[1].as_bytes(), &frame[..]);
        }
    }
}
