//! Frame struct with typed accessors.
//!
//! A frame is one length-delimited unit on the wire: a 16-byte header and
//! the body bytes it declares. Uses `bytes::Bytes` so bodies can be handed
//! to the codec without copying.
//!
//! # Example
//!
//! ```
//! use blaze_client::protocol::{Frame, Header, PacketKind};
//! use bytes::Bytes;
//!
//! let header = Header::new(9, 2, PacketKind::Result, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.correlation_id(), 42);
//! assert_eq!(frame.body(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, PacketKind, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the correlation id.
    #[inline]
    pub fn correlation_id(&self) -> u32 {
        self.header.correlation_id
    }

    /// Get the typed kind, if known.
    #[inline]
    pub fn kind(&self) -> Option<PacketKind> {
        self.header.packet_kind()
    }

    /// Check if the server flagged an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use blaze_client::protocol::{build_frame, Header, PacketKind, HEADER_SIZE};
///
/// let header = Header::new(9, 2, PacketKind::Command, 1, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let header = Header::new(4, 0x67, PacketKind::Message, 17, 4).with_error_code(2);
        let frame = Frame::new(header, Bytes::from_static(b"data"));

        assert_eq!(frame.correlation_id(), 17);
        assert_eq!(frame.kind(), Some(PacketKind::Message));
        assert_eq!(frame.body().len(), 4);
        assert!(frame.is_error());
    }

    #[test]
    fn test_build_frame_layout() {
        let header = Header::new(1, 0x28, PacketKind::Command, 3, 5);
        let bytes = build_frame(&header, b"hello");

        let parsed = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_empty_body() {
        let header = Header::new(0, 0, PacketKind::KeepAlive, 0, 0);
        assert_eq!(build_frame(&header, b"").len(), HEADER_SIZE);
    }

    #[test]
    fn test_build_frame_through_buffer() {
        use super::super::FrameBuffer;

        let header = Header::new(9, 2, PacketKind::Pong, 456, 10);
        let bytes = build_frame(&header, b"0123456789");

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id(), 456);
        assert_eq!(frames[0].body(), b"0123456789");
        assert_eq!(frames[0].kind(), Some(PacketKind::Pong));
    }
}
