//! Full packet codec: header + body.

use bytes::Bytes;

use super::MsgPackCodec;
use crate::error::{BlazeError, Result};
use crate::protocol::{method_name, Frame, Header, Packet, PacketKind, HEADER_SIZE};

/// Encodes [`Packet`]s to frames and decodes frames back to packets.
pub struct PacketCodec;

impl PacketCodec {
    /// Encode a packet to a header and body, ready for the writer.
    pub fn encode_parts(packet: &Packet) -> Result<(Header, Bytes)> {
        let (component, command) = packet.method_ids()?;
        let body = MsgPackCodec::encode_body(&packet.body)?;
        let body_length = u32::try_from(body.len()).map_err(|_| {
            BlazeError::MalformedFrame(format!("Body of {} bytes is too large", body.len()))
        })?;
        let header = Header::new(
            component,
            command,
            packet.kind,
            packet.correlation_id,
            body_length,
        )
        .with_error_code(packet.error_code);
        Ok((header, Bytes::from(body)))
    }

    /// Encode a packet to one contiguous frame.
    ///
    /// Deterministic: the same packet always encodes to the same bytes.
    pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
        let (header, body) = Self::encode_parts(packet)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a complete frame.
    pub fn decode_frame(frame: &Frame) -> Result<Packet> {
        let kind = PacketKind::try_from(frame.header.kind)?;
        let body = MsgPackCodec::decode_body(frame.body())?;
        Ok(Packet {
            correlation_id: frame.header.correlation_id,
            method: method_name(frame.header.component, frame.header.command),
            kind,
            error_code: frame.header.error_code,
            body,
        })
    }

    /// Decode one frame from a byte slice holding exactly header + body.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` if the slice is shorter than the header, or its
    /// length disagrees with the header's declared body length.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        let header = Header::decode(bytes).ok_or_else(|| {
            BlazeError::MalformedFrame(format!(
                "Frame of {} bytes is shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            ))
        })?;
        if header.frame_length() != bytes.len() {
            return Err(BlazeError::MalformedFrame(format!(
                "Header declares {} body bytes but frame carries {}",
                header.body_length,
                bytes.len() - HEADER_SIZE
            )));
        }
        let frame = Frame::new(header, Bytes::copy_from_slice(&bytes[HEADER_SIZE..]));
        Self::decode_frame(&frame)
    }
}
