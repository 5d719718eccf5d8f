//! Dedicated writer task for frame sending.
//!
//! Every frame bound for the socket goes through one task that owns the
//! write half of the stream. Producers talk to it through a cloneable
//! [`WriterHandle`]; a frame can carry an acknowledgement channel so the
//! producer learns whether the bytes actually reached the transport.
//!
//! ```text
//! send()      ─┐
//! keepalive() ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TLS stream
//! login       ─┘
//! ```
//!
//! The first write error marks the transport as failed, fails every
//! queued acknowledgement, and ends the task. Dropping the last handle
//! ends the task cleanly and shuts the stream down (TLS close_notify).

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BlazeError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

type Ack = oneshot::Sender<std::result::Result<(), String>>;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (16 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body bytes (empty for heartbeats).
    pub body: Bytes,
    ack: Option<Ack>,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, body: Bytes) -> Self {
        Self {
            header: header.encode(),
            body,
            ack: None,
        }
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    fn acknowledge(&mut self, outcome: std::result::Result<(), String>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(outcome);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    transport_failed: Arc<AtomicBool>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame without waiting for it to be written.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closed() {
            return Err(BlazeError::Connection("Writer is closed".to_string()));
        }

        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            BlazeError::Connection("Writer task has stopped".to_string())
        })
    }

    /// Queue a frame and wait until it has been written and flushed.
    pub async fn write(&self, header: &Header, body: Bytes) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut frame = OutboundFrame::new(header, body);
        frame.ack = Some(ack_tx);

        self.send(frame).await?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(BlazeError::Connection(format!(
                "Failed to send packet: {reason}"
            ))),
            Err(_) => Err(BlazeError::Connection(
                "Writer task dropped the frame".to_string(),
            )),
        }
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(BlazeError::Connection(
                    "Write queue stayed saturated past the backpressure timeout".to_string(),
                ));
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Whether the writer can no longer accept frames.
    ///
    /// True once the task has exited, or the transport reported a failure.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.transport_failed()
    }

    /// Whether a write on the transport has failed.
    #[inline]
    pub fn transport_failed(&self) -> bool {
        self.transport_failed.load(Ordering::Acquire)
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let transport_failed = Arc::new(AtomicBool::new(false));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        transport_failed: transport_failed.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, transport_failed));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    transport_failed: Arc<AtomicBool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // All handles dropped; close the stream. Peers often drop the
            // socket before answering close_notify, so errors here are benign.
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Ignoring error while shutting down transport: {}", e);
            }
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let outcome = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        match outcome {
            Ok(()) => {
                for frame in &mut batch {
                    frame.acknowledge(Ok(()));
                }
            }
            Err(e) => {
                transport_failed.store(true, Ordering::Release);
                let reason = e.to_string();
                tracing::warn!("Transport write failed, writer stopping: {}", reason);
                for frame in &mut batch {
                    frame.acknowledge(Err(reason.clone()));
                }
                rx.close();
                while let Ok(mut frame) = rx.try_recv() {
                    pending.fetch_sub(1, Ordering::Release);
                    frame.acknowledge(Err(reason.clone()));
                }
                return Err(e);
            }
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(BlazeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            slices.push(IoSlice::new(&frame.header[skip_bytes.saturating_sub(offset)..]));
        }
        offset = header_end;

        if !frame.body.is_empty() {
            let body_end = offset + frame.body.len();
            if skip_bytes < body_end {
                slices.push(IoSlice::new(&frame.body[skip_bytes.saturating_sub(offset)..]));
            }
            offset = body_end;
        }
    }

    slices
}
