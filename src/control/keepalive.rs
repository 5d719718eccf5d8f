//! Heartbeat frame.

use std::time::Duration;

use crate::protocol::{build_frame, Header, PacketKind, UNCORRELATED_ID};

/// Default interval between heartbeats.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Header of the fixed heartbeat frame: no method, no correlation, no body.
pub fn heartbeat_header() -> Header {
    Header::new(0, 0, PacketKind::KeepAlive, UNCORRELATED_ID, 0)
}

/// The heartbeat frame as raw bytes.
pub fn heartbeat_frame() -> Vec<u8> {
    build_frame(&heartbeat_header(), &[])
}
