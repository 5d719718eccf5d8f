//! Protocol module - wire format, framing, and packet types.
//!
//! This module implements the Blaze envelope:
//! - 16-byte header encoding/decoding
//! - Frame buffer for reassembling frames from a byte stream
//! - Packet model and the method-name table

mod frame;
mod frame_buffer;
mod packet;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, DEFAULT_BUFFER_CAPACITY};
pub use packet::{body, method_ids, method_name, methods, Body, Packet};
pub use wire_format::{
    Header, PacketKind, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, MAX_CORRELATION_ID, UNCORRELATED_ID,
};
