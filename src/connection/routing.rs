//! Routing table for decoded inbound packets.

use super::pending::{PendingTable, Waiter};
use crate::protocol::{methods, Packet, PacketKind};

/// Where an inbound packet goes.
pub(crate) enum Route {
    /// Keepalive echo; dropped.
    Heartbeat,
    /// Reply to an in-flight request.
    Reply(Waiter),
    /// Server reports the session's permissions lapsed.
    SessionExpired,
    /// Server-initiated message or notification.
    Notice,
    /// Reply whose waiter is gone (late or never registered).
    Miss,
    /// Reply to an explicit ping.
    Pong,
    /// Anything else.
    Unmatched,
}

/// Classify `packet`, claiming its waiter if one is registered.
///
/// Checked in order: heartbeat, waiter, session expiry, then kind.
pub(crate) fn route(packet: &Packet, pending: &PendingTable) -> Route {
    if packet.is_heartbeat() {
        return Route::Heartbeat;
    }
    if let Some(waiter) = pending.take(packet.correlation_id) {
        return Route::Reply(waiter);
    }
    if packet.method == methods::GET_PERMISSIONS {
        return Route::SessionExpired;
    }
    match packet.kind {
        PacketKind::Message | PacketKind::Notification => Route::Notice,
        PacketKind::Result => Route::Miss,
        PacketKind::Pong => Route::Pong,
        PacketKind::Command | PacketKind::KeepAlive => Route::Unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;

    fn packet(method: &str, kind: PacketKind, id: u32) -> Packet {
        Packet::new(method, kind, Body::new()).with_correlation_id(id)
    }

    #[test]
    fn test_heartbeat_wins_over_waiter() {
        let pending = PendingTable::new();
        let (id, _rx) = pending.register(0).unwrap();
        let keepalive = Packet::keepalive().with_correlation_id(id);

        assert!(matches!(route(&keepalive, &pending), Route::Heartbeat));
        assert!(pending.contains(id));
    }

    #[test]
    fn test_reply_claims_waiter() {
        let pending = PendingTable::new();
        let (id, _rx) = pending.register(0).unwrap();

        let reply = packet(methods::GET_GAME_DATA, PacketKind::Result, id);
        assert!(matches!(route(&reply, &pending), Route::Reply(_)));
        assert_eq!(pending.len(), 0);

        assert!(matches!(route(&reply, &pending), Route::Miss));
    }

    #[test]
    fn test_permissions_push_expires_session() {
        let pending = PendingTable::new();
        let push = packet(methods::GET_PERMISSIONS, PacketKind::Notification, 0);
        assert!(matches!(route(&push, &pending), Route::SessionExpired));
    }

    #[test]
    fn test_kinds_without_waiter() {
        let pending = PendingTable::new();
        let cases = [
            (PacketKind::Message, "Notice"),
            (PacketKind::Notification, "Notice"),
            (PacketKind::Pong, "Pong"),
            (PacketKind::Command, "Unmatched"),
        ];
        for (kind, expected) in cases {
            let name = match route(&packet("Component(0x0F00).Command(0x0001)", kind, 77), &pending) {
                Route::Notice => "Notice",
                Route::Pong => "Pong",
                Route::Unmatched => "Unmatched",
                _ => "other",
            };
            assert_eq!(name, expected, "{kind:?}");
        }
    }
}
