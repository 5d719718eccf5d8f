//! Wire format encoding and decoding.
//!
//! Implements the 16-byte frame header:
//! ```text
//! ┌──────────┬───────────┬─────────┬───────────┬──────┬───────┬────────────────┐
//! │ Length   │ Component │ Command │ ErrorCode │ Kind │ Flags │ Correlation ID │
//! │ 4 bytes  │ 2 bytes   │ 2 bytes │ 2 bytes   │ 1    │ 1     │ 4 bytes        │
//! │ uint32 BE│ uint16 BE │uint16 BE│ uint16 BE │ u8   │ u8    │ uint32 BE      │
//! └──────────┴───────────┴─────────┴───────────┴──────┴───────┴────────────────┘
//! ```
//!
//! `Length` counts the body bytes that follow the header. All multi-byte
//! integers are Big Endian.

use crate::error::{BlazeError, Result};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Default maximum body size (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Highest correlation id a request may carry.
pub const MAX_CORRELATION_ID: u32 = 65_535;

/// Correlation id used by heartbeats and unsolicited pushes.
pub const UNCORRELATED_ID: u32 = 0;

/// Message kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PacketKind {
    /// Request from the client.
    Command,
    /// Reply to a command.
    Result,
    /// Reply carrying a message rather than a result set.
    Message,
    /// Unsolicited push from the server.
    Notification,
    /// Reply to a ping.
    Pong,
    /// Heartbeat.
    KeepAlive,
}

impl PacketKind {
    /// Wire representation.
    pub const fn as_u8(self) -> u8 {
        match self {
            PacketKind::Command => 0x00,
            PacketKind::Result => 0x20,
            PacketKind::Message => 0x40,
            PacketKind::Notification => 0x60,
            PacketKind::Pong => 0xA0,
            PacketKind::KeepAlive => 0xC0,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = BlazeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PacketKind::Command),
            0x20 => Ok(PacketKind::Result),
            0x40 => Ok(PacketKind::Message),
            0x60 => Ok(PacketKind::Notification),
            0xA0 => Ok(PacketKind::Pong),
            0xC0 => Ok(PacketKind::KeepAlive),
            other => Err(BlazeError::MalformedFrame(format!(
                "Unknown packet kind 0x{other:02X}"
            ))),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in bytes.
    pub body_length: u32,
    /// Remote component identifier.
    pub component: u16,
    /// Command identifier within the component.
    pub command: u16,
    /// Non-zero when the server reports an error for this reply.
    pub error_code: u16,
    /// Raw kind byte (see [`PacketKind`]).
    pub kind: u8,
    /// Flags byte (reserved, must be 0).
    pub flags: u8,
    /// Correlation identifier (0 = uncorrelated).
    pub correlation_id: u32,
}

impl Header {
    /// Create a new header with zero error code and flags.
    pub fn new(
        component: u16,
        command: u16,
        kind: PacketKind,
        correlation_id: u32,
        body_length: u32,
    ) -> Self {
        Self {
            body_length,
            component,
            command,
            error_code: 0,
            kind: kind.as_u8(),
            flags: 0,
            correlation_id,
        }
    }

    /// Set the error code.
    pub fn with_error_code(mut self, error_code: u16) -> Self {
        self.error_code = error_code;
        self
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use blaze_client::protocol::{Header, PacketKind};
    ///
    /// let header = Header::new(0x0001, 0x0028, PacketKind::Command, 7, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.body_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.component.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_be_bytes());
        buf[8..10].copy_from_slice(&self.error_code.to_be_bytes());
        buf[10] = self.kind;
        buf[11] = self.flags;
        buf[12..16].copy_from_slice(&self.correlation_id.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use blaze_client::protocol::Header;
    ///
    /// let bytes = [0, 0, 0, 100, 0, 1, 0, 0x28, 0, 0, 0x20, 0, 0, 0, 0, 7];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.body_length, 100);
    /// assert_eq!(header.command, 0x28);
    /// assert_eq!(header.correlation_id, 7);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            body_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            component: u16::from_be_bytes([buf[4], buf[5]]),
            command: u16::from_be_bytes([buf[6], buf[7]]),
            error_code: u16::from_be_bytes([buf[8], buf[9]]),
            kind: buf[10],
            flags: buf[11],
            correlation_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Check that the header can be framed.
    ///
    /// Only the declared body length is checked here. An unknown kind byte
    /// still frames correctly and is rejected when the packet is decoded.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_length > max_body_size {
            return Err(BlazeError::MalformedFrame(format!(
                "Body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }
        Ok(())
    }

    /// Typed kind, if the byte is known.
    #[inline]
    pub fn packet_kind(&self) -> Option<PacketKind> {
        PacketKind::try_from(self.kind).ok()
    }

    /// Check if the server flagged this reply as an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Total frame length (header + body).
    #[inline]
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.body_length as usize
    }
}
