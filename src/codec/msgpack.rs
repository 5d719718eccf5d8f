//! MsgPack body codec using `rmp-serde`.
//!
//! Bodies are always written with `to_vec_named` so tagged fields travel
//! as map keys, never as positional arrays. Field order is preserved on
//! both sides.

use crate::error::{BlazeError, Result};
use crate::protocol::Body;

/// MessagePack codec for packet bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a packet body. An empty body encodes to zero bytes.
    pub fn encode_body(body: &Body) -> Result<Vec<u8>> {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        Self::encode(body)
    }

    /// Decode a packet body. Zero bytes decode to an empty body.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if the bytes are not a MsgPack map.
    pub fn decode_body(bytes: &[u8]) -> Result<Body> {
        if bytes.is_empty() {
            return Ok(Body::new());
        }
        Self::decode(bytes).map_err(|e| BlazeError::MalformedFrame(format!("Undecodable body: {e}")))
    }
}
