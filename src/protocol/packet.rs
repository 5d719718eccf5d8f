//! Logical RPC packets and the method table.
//!
//! A [`Packet`] is what callers hand to [`Connection::send`](crate::Connection::send)
//! and what they get back. On the wire the method name travels as a numeric
//! `(component, command)` pair; [`method_ids`] and [`method_name`] translate
//! between the two.

use serde_json::{Map, Value};

use super::wire_format::{PacketKind, UNCORRELATED_ID};
use crate::error::{BlazeError, Result};

/// Ordered mapping of tagged body fields.
pub type Body = Map<String, Value>;

/// Well-known method names.
pub mod methods {
    /// Login with a short-lived auth code.
    pub const LOGIN: &str = "Authentication.login";
    /// Batched game data lookup by game id.
    pub const GET_GAME_DATA: &str = "GameManager.getGameDataFromId";
    /// Pushed by the server when the session's permissions lapse.
    pub const GET_PERMISSIONS: &str = "UserSessions.getPermissions";
    /// Explicit ping.
    pub const PING: &str = "Util.ping";
    /// Heartbeat.
    pub const KEEPALIVE: &str = "KeepAlive";
}

const METHOD_TABLE: &[(&str, u16, u16)] = &[
    (methods::LOGIN, 0x0001, 0x0028),
    (methods::GET_GAME_DATA, 0x0004, 0x0067),
    (methods::GET_PERMISSIONS, 0x7802, 0x0011),
    (methods::PING, 0x0009, 0x0002),
    (methods::KEEPALIVE, 0x0000, 0x0000),
];

/// Resolve a method name to its `(component, command)` pair.
///
/// Synthetic names produced by [`method_name`] for unknown pairs resolve
/// back to the same pair.
pub fn method_ids(name: &str) -> Option<(u16, u16)> {
    METHOD_TABLE
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, component, command)| (*component, *command))
        .or_else(|| parse_synthetic(name))
}

/// Resolve a `(component, command)` pair to a method name.
pub fn method_name(component: u16, command: u16) -> String {
    METHOD_TABLE
        .iter()
        .find(|(_, c, m)| *c == component && *m == command)
        .map(|(n, _, _)| (*n).to_string())
        .unwrap_or_else(|| format!("Component(0x{component:04X}).Command(0x{command:04X})"))
}

fn parse_synthetic(name: &str) -> Option<(u16, u16)> {
    let rest = name.strip_prefix("Component(0x")?;
    let (component, rest) = rest.split_once(").Command(0x")?;
    let command = rest.strip_suffix(')')?;
    Some((
        u16::from_str_radix(component, 16).ok()?,
        u16::from_str_radix(command, 16).ok()?,
    ))
}

/// A logical RPC unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Correlation id (0 = not yet assigned / uncorrelated).
    pub correlation_id: u32,
    /// Remote operation name.
    pub method: String,
    /// Message kind.
    pub kind: PacketKind,
    /// Server error code (0 = success).
    pub error_code: u16,
    /// Tagged body fields.
    pub body: Body,
}

impl Packet {
    /// Create a packet.
    pub fn new(method: impl Into<String>, kind: PacketKind, body: Body) -> Self {
        Self {
            correlation_id: UNCORRELATED_ID,
            method: method.into(),
            kind,
            error_code: 0,
            body,
        }
    }

    /// Create a command packet; the connection assigns the correlation id.
    pub fn command(method: impl Into<String>, body: Body) -> Self {
        Self::new(method, PacketKind::Command, body)
    }

    /// Create the heartbeat packet.
    pub fn keepalive() -> Self {
        Self::new(methods::KEEPALIVE, PacketKind::KeepAlive, Body::new())
    }

    /// Build a reply to `request` carrying the same method and correlation id.
    pub fn reply_to(request: &Packet, kind: PacketKind, body: Body) -> Self {
        Self {
            correlation_id: request.correlation_id,
            method: request.method.clone(),
            kind,
            error_code: 0,
            body,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: u32) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the error code.
    pub fn with_error_code(mut self, error_code: u16) -> Self {
        self.error_code = error_code;
        self
    }

    /// Look up a body field by tag.
    pub fn field(&self, tag: &str) -> Option<&Value> {
        self.body.get(tag)
    }

    /// Whether this is a liveness echo.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == PacketKind::KeepAlive || self.method == methods::KEEPALIVE
    }

    /// Wire `(component, command)` pair for this packet's method.
    pub fn method_ids(&self) -> Result<(u16, u16)> {
        method_ids(&self.method)
            .ok_or_else(|| BlazeError::MalformedFrame(format!("Unknown method: {}", self.method)))
    }
}

/// Build a [`Body`] from `(tag, value)` pairs, keeping their order.
pub fn body<I, K>(fields: I) -> Body
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
