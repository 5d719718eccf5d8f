//! Control traffic the connection and pool generate themselves.
//!
//! - [`login_packet`] / [`Session`] - authentication handshake
//! - [`heartbeat_frame`] - fixed keepalive payload

mod keepalive;
mod login;

pub use keepalive::{heartbeat_frame, heartbeat_header, DEFAULT_KEEPALIVE_INTERVAL};
pub use login::{login_packet, Session};
