//! Dedicated writer task for one peer's outbound frames.
//!
//! Senders never touch the socket. Each peer owns a writer task that receives
//! encoded frames via an unbounded mpsc channel, so `send` never blocks the
//! caller, and frames queued together are written with a single vectored
//! write.
//!
//! # Architecture
//!
//! ```text
//! Application ─┐
//! Heartbeats  ─┼─► mpsc::UnboundedSender<WriterCommand> ─► Writer Task ─► Stream
//! Diagnostics ─┘
//! ```
//!
//! A completion callback attached to a frame runs on the writer task once the
//! batch containing it has been flushed (or has failed). Callbacks must not
//! block.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{HachiError, Result};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Completion callback for a queued frame.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Bytes ready to be written to the stream.
pub struct OutboundFrame {
    /// Fully encoded frame (or raw diagnostic bytes).
    pub bytes: Bytes,
    /// Invoked with the write outcome.
    pub done: Option<SendCallback>,
}

impl OutboundFrame {
    /// Create a new outbound frame without a completion callback.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, done: None }
    }

    /// Create a new outbound frame with a completion callback.
    #[inline]
    pub fn with_callback(bytes: Bytes, done: SendCallback) -> Self {
        Self {
            bytes,
            done: Some(done),
        }
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Report the outcome to the callback, if any.
    pub fn complete(self, result: Result<()>) {
        if let Some(done) = self.done {
            done(result);
        }
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("size", &self.bytes.len())
            .field("has_callback", &self.done.is_some())
            .finish()
    }
}

/// Command consumed by the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    /// Write these bytes.
    Frame(OutboundFrame),
    /// Flush everything queued before this command, then shut the stream down.
    Shutdown,
}

/// Time of the last completed write.
#[derive(Debug)]
struct WriteActivity {
    origin: Instant,
    elapsed_micros: AtomicU64,
}

impl WriteActivity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_micros: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let micros = self.origin.elapsed().as_micros() as u64;
        self.elapsed_micros.fetch_max(micros, Ordering::AcqRel);
    }

    fn last(&self) -> Instant {
        self.origin + std::time::Duration::from_micros(self.elapsed_micros.load(Ordering::Acquire))
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and shared by everything that writes to a peer.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for commands.
    tx: mpsc::UnboundedSender<WriterCommand>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
    /// Set once the stream can no longer be written.
    closed: Arc<AtomicBool>,
    /// Last successful write.
    activity: Arc<WriteActivity>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Never blocks. Hands the frame back if the writer is already closed so
    /// the caller can report the failure.
    pub fn send(&self, frame: OutboundFrame) -> std::result::Result<(), OutboundFrame> {
        if self.is_closed() {
            return Err(frame);
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(WriterCommand::Frame(frame)).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e.0 {
                WriterCommand::Frame(frame) => frame,
                WriterCommand::Shutdown => unreachable!("only frames are sent here"),
            }
        })
    }

    /// Ask the writer to flush queued frames and shut the stream down.
    ///
    /// Later sends are refused immediately.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WriterCommand::Shutdown);
        }
    }

    /// Whether the stream is closed for writing.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// When bytes last reached the stream (the task's start time if none yet).
    pub fn last_write(&self) -> Instant {
        self.activity.last()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// # Arguments
///
/// * `writer` - The async writer (stream write half)
/// * `peer_id` - Identifier used in logs and errors
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)` where the JoinHandle can be used
/// to wait for the writer task to complete.
pub fn spawn_writer_task<W>(writer: W, peer_id: Arc<str>) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let activity = Arc::new(WriteActivity::new());

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        closed: closed.clone(),
        activity: activity.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, closed, activity, peer_id));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the stream.
///
/// Uses batching and scatter/gather I/O (writev) for efficiency.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    activity: Arc<WriteActivity>,
    peer_id: Arc<str>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        // Wait for first command
        let first = match rx.recv().await {
            Some(cmd) => cmd,
            None => {
                // Every handle dropped, clean shutdown
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        // Collect additional ready frames (non-blocking), stopping at a shutdown
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut shutdown = false;
        let mut next = Some(first);

        while let Some(cmd) = next.take() {
            match cmd {
                WriterCommand::Frame(frame) => batch.push(frame),
                WriterCommand::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
            if batch.len() < MAX_BATCH_SIZE {
                next = rx.try_recv().ok();
            }
        }

        // Callbacks are not Sync; keep them out of the awaited write
        let batch_size = batch.len();
        let (chunks, callbacks): (Vec<Bytes>, Vec<Option<SendCallback>>) = batch
            .into_iter()
            .map(|frame| (frame.bytes, frame.done))
            .unzip();

        let result = write_batch(&mut writer, &chunks).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        match result {
            Ok(()) => {
                if batch_size > 0 {
                    activity.touch();
                    let bytes: usize = chunks.iter().map(Bytes::len).sum();
                    tracing::trace!(peer = %peer_id, frames = batch_size, bytes, "OUT");
                }
                for done in callbacks.into_iter().flatten() {
                    done(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "write failed");
                closed.store(true, Ordering::Release);
                for done in callbacks.into_iter().flatten() {
                    done(Err(e.duplicate()));
                }
                drain_closed(&mut rx, &pending, &peer_id);
                return Err(e);
            }
        }

        if shutdown {
            closed.store(true, Ordering::Release);
            let _ = writer.shutdown().await;
            drain_closed(&mut rx, &pending, &peer_id);
            tracing::debug!(peer = %peer_id, "writer shut down");
            return Ok(());
        }
    }
}

/// Fail every frame still queued after the stream closed.
fn drain_closed(
    rx: &mut mpsc::UnboundedReceiver<WriterCommand>,
    pending: &AtomicUsize,
    peer_id: &Arc<str>,
) {
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if let WriterCommand::Frame(frame) = cmd {
            pending.fetch_sub(1, Ordering::Release);
            frame.complete(Err(HachiError::WriteOnClosedPeer(peer_id.to_string())));
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Tries a single vectored write first; on a partial write, continues with
/// the remaining slices.
async fn write_batch<W>(writer: &mut W, chunks: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = chunks.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = chunks
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| IoSlice::new(c))
        .collect();

    // Fast path: the kernel buffer takes everything at once
    let mut total_written = writer.write_vectored(&slices).await?;

    while total_written < total_size {
        if total_written == 0 {
            return Err(HachiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        let remaining_slices = build_remaining_slices(chunks, total_written);
        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(HachiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(chunks: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(chunks.len());
    let mut skipped = 0;

    for chunk in chunks {
        let start = skipped;
        let end = skipped + chunk.len();

        if skip_bytes < end {
            let start_in_chunk = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&chunk[start_in_chunk..]));
        }
        skipped = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::oneshot;

    fn peer_id() -> Arc<str> {
        Arc::from("test-peer")
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = OutboundFrame::new(Bytes::from_static(b"hello"));
        assert_eq!(frame.size(), 5);
        assert!(frame.done.is_none());
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, peer_id());

        handle
            .send(OutboundFrame::new(Bytes::from_static(b"hello")))
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_callback_reports_success() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, peer_id());

        let (tx, rx) = oneshot::channel();
        let frame = OutboundFrame::with_callback(
            Bytes::from_static(b"abc"),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        handle.send(frame).unwrap();

        assert!(rx.await.unwrap());
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_advances_after_write() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, peer_id());
        let before = handle.last_write();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(handle.last_write(), before);

        let (tx, rx) = oneshot::channel();
        let frame = OutboundFrame::with_callback(
            Bytes::from_static(b"tick"),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        handle.send(frame).unwrap();
        assert!(rx.await.unwrap());

        assert!(handle.last_write() >= before + Duration::from_secs(3));
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, peer_id());

        for i in 0..10u32 {
            handle
                .send(OutboundFrame::new(Bytes::copy_from_slice(&i.to_le_bytes())))
                .unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();

        for (i, chunk) in buf.chunks(4).enumerate() {
            assert_eq!(chunk, &(i as u32).to_le_bytes());
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_then_refuses() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, peer_id());

        handle
            .send(OutboundFrame::new(Bytes::from_static(b"last words")))
            .unwrap();
        handle.shutdown();

        assert!(handle.is_closed());
        assert!(handle
            .send(OutboundFrame::new(Bytes::from_static(b"too late")))
            .is_err());

        assert!(task.await.unwrap().is_ok());

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last words");
    }

    #[tokio::test]
    async fn test_write_failure_fails_callbacks() {
        let (client, server) = duplex(16);
        drop(server);
        let (handle, task) = spawn_writer_task(client, peer_id());

        let (tx, rx) = oneshot::channel();
        let frame = OutboundFrame::with_callback(
            Bytes::from_static(b"nobody listens"),
            Box::new(move |result| {
                let _ = tx.send(result.is_err());
            }),
        );
        handle.send(frame).unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap());
        assert!(task.await.unwrap().is_err());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_frame() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"lo");
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_skip_first_frame() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"world");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(written.len(), 15);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, peer_id());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
