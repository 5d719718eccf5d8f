//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 16 bytes
//! - `WaitingForBody`: Header parsed, need N more body bytes
//!
//! A frame is emitted exactly once, as soon as its declared length has
//! been accumulated. A header that declares a body longer than the limit
//! cannot be framed reliably; frames completed earlier in the same push
//! are still returned, the remaining bytes are discarded and the state
//! resets so parsing restarts at the next read (best-effort resync).
//!
//! # Example
//!
//! ```ignore
//! use blaze_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&chunk_from_socket);
//! for frame in frames {
//!     println!("frame for request {}", frame.correlation_id());
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;

/// Default initial capacity for the accumulation buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 16 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
    /// Frames discarded by resynchronization.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 16MB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_body(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self::with_capacity_and_max_body(DEFAULT_BUFFER_CAPACITY, max_body_size)
    }

    /// Create a new frame buffer with custom capacity and max body.
    pub fn with_capacity_and_max_body(capacity: usize, max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            max_body_size,
            discarded: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push. A header
    /// declaring a body over `max_body_size` ends extraction: the frames
    /// before it are returned, everything after it is dropped and counted
    /// in [`discarded`](Self::discarded).
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }

        frames
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        match &self.state {
            State::WaitingForHeader => {
                let header = Header::decode(&self.buffer)?;

                if let Err(e) = header.validate(self.max_body_size) {
                    self.discarded += 1;
                    tracing::warn!(
                        correlation_id = header.correlation_id,
                        dropped_bytes = self.buffer.len(),
                        "Resynchronizing frame buffer: {}",
                        e
                    );
                    self.clear();
                    return None;
                }

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.body_length == 0 {
                    return Some(Frame::new(header, Bytes::new()));
                }

                self.state = State::WaitingForBody {
                    header,
                    remaining: header.body_length,
                };

                self.try_extract_one()
            }

            State::WaitingForBody { header, remaining } => {
                let remaining = *remaining as usize;

                if self.buffer.len() < remaining {
                    return None;
                }

                let body = self.buffer.split_to(remaining).freeze();
                let header = *header;

                self.state = State::WaitingForHeader;

                Some(Frame::new(header, body))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of oversized headers that forced a resynchronization.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, PacketKind};

    fn make_frame_bytes(correlation_id: u32, body: &[u8]) -> Vec<u8> {
        let header = Header::new(4, 0x67, PacketKind::Result, correlation_id, body.len() as u32);
        build_frame(&header, body)
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b"hello"));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id(), 42);
        assert_eq!(frames[0].body(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = make_frame_bytes(1, b"first");
        combined.extend(make_frame_bytes(2, b"second"));
        combined.extend(make_frame_bytes(3, b"third"));

        let frames = buffer.push(&combined);

        let ids: Vec<_> = frames.iter().map(|f| f.correlation_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, b"test");

        assert!(buffer.push(&frame_bytes[..5]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert_eq!(buffer.len(), 5);

        let frames = buffer.push(&frame_bytes[5..]);
        assert_eq!(frames.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let body = b"this is a longer body that arrives over several reads";
        let frame_bytes = make_frame_bytes(42, body);

        let partial_len = HEADER_SIZE + 10;
        assert!(buffer.push(&frame_bytes[..partial_len]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let frames = buffer.push(&frame_bytes[partial_len..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body(), body);
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b""));

        assert_eq!(frames.len(), 1);
        assert!(frames[0].body().is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_single_push() {
        let mut stream = make_frame_bytes(7, b"alpha");
        stream.extend(make_frame_bytes(8, b""));
        stream.extend(make_frame_bytes(9, &[0xAB; 300]));

        let whole = FrameBuffer::new().push(&stream);

        let mut buffer = FrameBuffer::new();
        let mut pieces = Vec::new();
        for byte in &stream {
            pieces.extend(buffer.push(&[*byte]));
        }

        assert_eq!(whole.len(), 3);
        assert_eq!(pieces.len(), whole.len());
        for (a, b) in whole.iter().zip(&pieces) {
            assert_eq!(a.header, b.header);
            assert_eq!(a.body, b.body);
        }
    }

    #[test]
    fn test_oversized_body_resets_state() {
        let mut buffer = FrameBuffer::with_max_body(100);

        let header = Header::new(4, 0x67, PacketKind::Result, 1, 1000);
        let frames = buffer.push(&header.encode());

        assert!(frames.is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert_eq!(buffer.discarded(), 1);

        // Next well-formed frame parses normally.
        let frames = buffer.push(&make_frame_bytes(2, b"ok"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id(), 2);
    }

    #[test]
    fn test_frames_before_oversized_header_are_kept() {
        let mut buffer = FrameBuffer::with_max_body(64);

        let mut data = make_frame_bytes(1, b"reply");
        data.extend(make_frame_bytes(2, b"also fine"));
        data.extend_from_slice(&Header::new(4, 0x67, PacketKind::Result, 3, 1000).encode());
        data.extend_from_slice(b"junk that belongs to the oversized body");

        let frames = buffer.push(&data);

        let ids: Vec<_> = frames.iter().map(|f| f.correlation_id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(frames[0].body(), b"reply");
        assert_eq!(buffer.discarded(), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, b"test");

        buffer.push(&frame_bytes[..HEADER_SIZE]);
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();

        let frame2 = make_frame_bytes(2, b"second");
        let mut data = make_frame_bytes(1, b"first");
        data.extend_from_slice(&frame2[..5]);

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id(), 1);

        let frames = buffer.push(&frame2[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id(), 2);
    }
}
