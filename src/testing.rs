//! In-memory Blaze server for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::codec::PacketCodec;
use crate::error::{BlazeError, Result};
use crate::protocol::{body, methods, Body, FrameBuffer, Packet, PacketKind};
use crate::provider::BoxFuture;
use crate::transport::{BoxedStream, Connector};

/// Server end of an in-memory connection.
pub(crate) struct ServerSide {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    frames: FrameBuffer,
    queued: VecDeque<Packet>,
}

/// A connected client stream and its server end.
pub(crate) fn pipe() -> (DuplexStream, ServerSide) {
    let (client, server) = duplex(256 * 1024);
    let (reader, writer) = split(server);
    (
        client,
        ServerSide {
            reader,
            writer,
            frames: FrameBuffer::new(),
            queued: VecDeque::new(),
        },
    )
}

impl ServerSide {
    /// Next packet from the client, heartbeats included. `None` on EOF.
    pub(crate) async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.queued.pop_front() {
                return Some(packet);
            }
            let mut buf = [0u8; 4096];
            let n = self.reader.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.frames.push(&buf[..n]) {
                self.queued.push_back(PacketCodec::decode_frame(&frame).ok()?);
            }
        }
    }

    /// Next non-heartbeat packet from the client.
    pub(crate) async fn recv_request(&mut self) -> Option<Packet> {
        loop {
            let packet = self.recv().await?;
            if !packet.is_heartbeat() {
                return Some(packet);
            }
        }
    }

    pub(crate) async fn send(&mut self, packet: &Packet) {
        let bytes = PacketCodec::encode(packet).unwrap();
        self.send_raw(&bytes).await;
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
        let _ = self.writer.flush().await;
    }

    pub(crate) async fn reply(&mut self, request: &Packet, fields: Body) {
        self.send(&Packet::reply_to(request, PacketKind::Result, fields))
            .await;
    }
}

/// Decides the reply to each request; `None` leaves it unanswered.
pub(crate) type Responder = Arc<dyn Fn(&Packet) -> Option<Packet> + Send + Sync>;

/// Answer requests with `responder` until the client hangs up.
pub(crate) async fn serve(mut server: ServerSide, responder: Responder) {
    while let Some(request) = server.recv_request().await {
        if let Some(reply) = responder(&request) {
            server.send(&reply).await;
        }
    }
}

/// Identity fields of a successful login.
pub(crate) fn login_reply_body(persona_id: u64) -> Body {
    body([
        ("DSNM", json!(format!("persona-{persona_id}"))),
        ("PID", json!(persona_id)),
        ("UID", json!(persona_id + 1)),
        ("CGID", json!([30, 1, persona_id + 2])),
    ])
}

/// One game roster as the server lays it out: game id → game.
pub(crate) fn roster_body(game_ids: &[u64], players_per_game: u64) -> Body {
    game_ids
        .iter()
        .map(|game_id| {
            let players: Vec<_> = (0..players_per_game)
                .map(|i| {
                    json!({
                        "PID": game_id * 100 + i,
                        "NAME": format!("player-{game_id}-{i}"),
                        "TIDX": i % 2,
                        "ROLE": "soldier",
                    })
                })
                .collect();
            (
                game_id.to_string(),
                json!({ "GNAM": format!("game-{game_id}"), "PROS": players }),
            )
        })
        .collect()
}

/// Replies to login and roster requests like a healthy backend.
pub(crate) fn blaze_responder() -> Responder {
    Arc::new(|request: &Packet| {
        let fields = match request.method.as_str() {
            methods::LOGIN => login_reply_body(1000),
            methods::GET_GAME_DATA => {
                let ids: Vec<u64> = request
                    .field("GLST")
                    .and_then(|v| v.as_array())
                    .map(|ids| ids.iter().filter_map(|v| v.as_u64()).collect())
                    .unwrap_or_default();
                roster_body(&ids, 2)
            }
            _ => Body::new(),
        };
        Some(Packet::reply_to(request, PacketKind::Result, fields))
    })
}

/// Connector that opens in-memory pipes served by a responder.
pub(crate) struct FakeConnector {
    responder: Responder,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(BlazeError::Connection(format!(
                    "Failed to connect to {host}:{port}: refused"
                )));
            }
            let (client, server) = pipe();
            tokio::spawn(serve(server, self.responder.clone()));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}
