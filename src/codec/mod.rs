//! Codec module - serialization of packet bodies and whole packets.
//!
//! - [`MsgPackCodec`] - MessagePack bodies using `rmp-serde` (`to_vec_named`)
//! - [`PacketCodec`] - header + body, the only codec the connection talks to
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! The connection relies on two facts only: the header has a fixed size
//! known in advance, and its length field equals the number of body bytes
//! that follow. Swapping the body encoding means replacing `MsgPackCodec`.
//!
//! # Example
//!
//! ```
//! use blaze_client::codec::PacketCodec;
//! use blaze_client::protocol::{body, methods, Packet};
//! use serde_json::json;
//!
//! let packet = Packet::command(methods::PING, body([("TIME", json!(1))]))
//!     .with_correlation_id(3);
//! let bytes = PacketCodec::encode(&packet).unwrap();
//! assert_eq!(PacketCodec::decode(&bytes).unwrap(), packet);
//! ```

mod msgpack;
mod packet;

pub use msgpack::MsgPackCodec;
pub use packet::PacketCodec;
