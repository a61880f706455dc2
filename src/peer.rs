//! One live connection: reassembly, heartbeat filtering, sending.
//!
//! A [`Peer`] is created around any `AsyncRead + AsyncWrite` stream (plain
//! TCP, TLS, or an in-memory duplex in tests). Creation spawns two tasks:
//! - a read task owning the connection's [`FrameBuffer`], which feeds every
//!   chunk through the reassembler and reports to a [`ConnectionEvents`]
//! - a writer task (see [`crate::writer`]) draining queued frames
//!
//! The read task is the only code touching the accumulation state, so no
//! locking is needed around it.
//!
//! # Example
//!
//! ```ignore
//! use hachi_nio::{Peer, PeerConfig, Header};
//!
//! let peer = Peer::spawn(stream, "peer-1", None, &PeerConfig::default(), events);
//! peer.send(&Header::with_transaction("GREETINGS"), "Hello World!");
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{HachiError, Result};
use crate::header::Header;
use crate::protocol::{
    encode_with, Frame, FrameBuffer, WireVersion, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_PROBLEM_LINE,
};
use crate::writer::{spawn_writer_task, OutboundFrame, SendCallback, WriterHandle};

/// Default read buffer size per connection.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Observer for one or more peers.
///
/// Callbacks run on the peer's read task, in stream order. They must not
/// block; forward to a channel for anything slow.
pub trait ConnectionEvents: Send + Sync + 'static {
    /// The peer was created around a connected stream.
    fn on_connected(&self, _peer: &Peer) {}

    /// A complete non-heartbeat frame arrived.
    fn on_message(&self, peer: &Peer, header: Header, payload: Bytes);

    /// The remote side will send no more data.
    fn on_end(&self, _peer: &Peer) {}

    /// The stream is fully closed.
    fn on_close(&self, _peer: &Peer, _had_error: bool) {}

    /// Nothing was read or written for the configured idle duration. The connection stays open.
    fn on_timeout(&self, _peer: &Peer) {}

    /// Stream-level failure or protocol violation. A close follows.
    fn on_error(&self, _peer: &Peer, _error: HachiError) {}
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Emit a timeout event after this long with no data read or written.
    pub idle_timeout: Option<Duration>,
    /// Frame layout spoken on the connection.
    pub wire_version: WireVersion,
    /// Largest frame accepted from the remote side.
    pub max_frame_size: u32,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            wire_version: WireVersion::Current,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

struct PeerInner {
    id: Arc<str>,
    remote_addr: Option<SocketAddr>,
    version: WireVersion,
    writer: WriterHandle,
    close_signal: Notify,
}

/// Handle to one live connection.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Wrap a connected stream.
    ///
    /// Emits `on_connected` before any message from this peer, then starts
    /// reading. Must be called within a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        config: &PeerConfig,
        events: Arc<dyn ConnectionEvents>,
    ) -> Peer
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id: Arc<str> = Arc::from(id.into());
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, id.clone());

        let peer = Peer {
            inner: Arc::new(PeerInner {
                id,
                remote_addr,
                version: config.wire_version,
                writer,
                close_signal: Notify::new(),
            }),
        };

        tracing::debug!(peer = %peer.id(), remote = ?remote_addr, "peer connected");
        events.on_connected(&peer);

        let frame_buffer = FrameBuffer::with_config(
            config.wire_version,
            config.read_buffer_size,
            config.max_frame_size,
        );
        tokio::spawn(read_loop(
            peer.clone(),
            reader,
            frame_buffer,
            events,
            config.idle_timeout,
            config.read_buffer_size,
            writer_task,
        ));

        peer
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Remote address, when the stream is a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Frame layout spoken on this connection.
    pub fn wire_version(&self) -> WireVersion {
        self.inner.version
    }

    /// Whether the stream is closed for writing.
    pub fn is_closed(&self) -> bool {
        self.inner.writer.is_closed()
    }

    /// Frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.inner.writer.pending_count()
    }

    /// Send a frame (fire-and-forget).
    ///
    /// Never blocks. On a closed peer, or if the frame cannot be encoded, the
    /// failure is logged and the frame dropped.
    pub fn send(&self, header: &Header, payload: impl AsRef<[u8]>) {
        self.enqueue(header, payload.as_ref(), None);
    }

    /// Send a frame and report the write outcome to `callback`.
    ///
    /// The callback runs on the writer task once the frame has been flushed
    /// to the stream, or immediately on the caller's task if the frame could
    /// not be queued.
    pub fn send_with<F>(&self, header: &Header, payload: impl AsRef<[u8]>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(header, payload.as_ref(), Some(Box::new(callback)));
    }

    /// Send a frame and wait until it has been written to the stream.
    pub async fn send_confirmed(&self, header: &Header, payload: impl AsRef<[u8]>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_with(header, payload, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| Err(HachiError::WriteOnClosedPeer(self.id().to_string())))
    }

    /// Close the connection from this side.
    ///
    /// Queued frames are flushed first. A close event follows.
    pub fn close(&self) {
        tracing::debug!(peer = %self.id(), "closing peer");
        self.inner.writer.shutdown();
        self.inner.close_signal.notify_one();
    }

    fn enqueue(&self, header: &Header, payload: &[u8], done: Option<SendCallback>) {
        if self.is_closed() {
            tracing::error!(peer = %self.id(), "OUT socket is destroyed");
            report(done, Err(HachiError::WriteOnClosedPeer(self.id().to_string())));
            return;
        }

        let bytes = match encode_with(self.inner.version, header, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(peer = %self.id(), error = %e, "failed to encode frame");
                report(done, Err(e));
                return;
            }
        };

        let frame = OutboundFrame { bytes, done };
        if let Err(frame) = self.inner.writer.send(frame) {
            tracing::error!(peer = %self.id(), "OUT socket is destroyed");
            frame.complete(Err(HachiError::WriteOnClosedPeer(self.id().to_string())));
        }
    }

    /// Feed one inbound chunk through the reassembler.
    fn handle_chunk(
        &self,
        frame_buffer: &mut FrameBuffer,
        chunk: &[u8],
        events: &dyn ConnectionEvents,
    ) -> Result<usize> {
        frame_buffer.push_with(chunk, |frame| self.dispatch_frame(frame, events))
    }

    fn dispatch_frame(&self, frame: Frame, events: &dyn ConnectionEvents) {
        match frame.parse_header() {
            Ok(header) if header.is_heartbeat() => {
                tracing::trace!(peer = %self.id(), id = ?header.id(), "heartbeat received");
            }
            Ok(header) => events.on_message(self, header, frame.payload),
            Err(e) => {
                // Message-local: the connection stays usable
                tracing::warn!(
                    peer = %self.id(),
                    error = %e,
                    header_len = frame.header.len(),
                    "dropping frame with malformed header"
                );
            }
        }
    }

    /// Tell the remote side why it is being dropped, then shut down.
    fn reject_protocol(&self) {
        let _ = self
            .inner
            .writer
            .send(OutboundFrame::new(Bytes::from_static(PROTOCOL_PROBLEM_LINE)));
        self.inner.writer.shutdown();
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Peer {}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn report(done: Option<SendCallback>, result: Result<()>) {
    if let Some(done) = done {
        done(result);
    }
}

enum ReadOutcome {
    Data(usize),
    Idle,
    Failed(std::io::Error),
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], idle_deadline: Option<Instant>) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let read = match idle_deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, reader.read(buf)).await {
            Ok(read) => read,
            Err(_) => return ReadOutcome::Idle,
        },
        None => reader.read(buf).await,
    };

    match read {
        Ok(n) => ReadOutcome::Data(n),
        Err(e) => ReadOutcome::Failed(e),
    }
}

/// Main read loop - reads chunks, extracts frames, dispatches events.
async fn read_loop<R>(
    peer: Peer,
    mut reader: R,
    mut frame_buffer: FrameBuffer,
    events: Arc<dyn ConnectionEvents>,
    idle_timeout: Option<Duration>,
    read_buffer_size: usize,
    mut writer_task: JoinHandle<Result<()>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size.max(1)];
    let mut writer_finished = false;
    // Reads and completed writes both count as activity
    let mut last_activity = Instant::now();

    let had_error = loop {
        let idle_deadline = idle_timeout
            .map(|idle| last_activity.max(peer.inner.writer.last_write()) + idle);

        let outcome = tokio::select! {
            biased;
            _ = peer.inner.close_signal.notified() => break false,
            joined = &mut writer_task, if !writer_finished => {
                writer_finished = true;
                match joined {
                    Ok(Ok(())) => break false,
                    Ok(Err(e)) => {
                        tracing::debug!(peer = %peer.id(), error = %e, "write side failed");
                        events.on_error(&peer, e);
                    }
                    Err(e) => {
                        tracing::error!(peer = %peer.id(), error = %e, "writer task aborted");
                        events.on_error(&peer, HachiError::Io(std::io::Error::other(e)));
                    }
                }
                break true;
            }
            outcome = read_chunk(&mut reader, &mut buf, idle_deadline) => outcome,
        };

        match outcome {
            ReadOutcome::Idle => {
                let active = last_activity.max(peer.inner.writer.last_write());
                if let Some(idle) = idle_timeout {
                    if active + idle > Instant::now() {
                        // A write landed while the read was pending
                        continue;
                    }
                }
                tracing::debug!(peer = %peer.id(), "idle timeout");
                events.on_timeout(&peer);
                last_activity = Instant::now();
            }
            ReadOutcome::Data(0) => {
                tracing::debug!(peer = %peer.id(), "remote ended the stream");
                events.on_end(&peer);
                break false;
            }
            ReadOutcome::Data(n) => {
                last_activity = Instant::now();
                tracing::trace!(peer = %peer.id(), remote = ?peer.remote_addr(), bytes = n, "IN");
                if let Err(e) = peer.handle_chunk(&mut frame_buffer, &buf[..n], events.as_ref()) {
                    tracing::error!(peer = %peer.id(), error = %e, "Protocol problem.");
                    peer.reject_protocol();
                    events.on_error(&peer, e);
                    break true;
                }
            }
            ReadOutcome::Failed(e) => {
                tracing::debug!(peer = %peer.id(), error = %e, "read failed");
                peer.inner.writer.shutdown();
                events.on_error(&peer, HachiError::Io(e));
                break true;
            }
        }
    };

    // Flush anything still queued, then release the stream
    peer.inner.writer.shutdown();
    if !writer_finished {
        let _ = writer_task.await;
    }

    tracing::debug!(peer = %peer.id(), had_error, "peer closed");
    events.on_close(&peer, had_error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Seen {
        Connected(String),
        Message(Header, Bytes),
        End,
        Close(bool),
        Timeout,
        Error(String),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl ConnectionEvents for Recorder {
        fn on_connected(&self, peer: &Peer) {
            let _ = self.0.send(Seen::Connected(peer.id().to_string()));
        }
        fn on_message(&self, _peer: &Peer, header: Header, payload: Bytes) {
            let _ = self.0.send(Seen::Message(header, payload));
        }
        fn on_end(&self, _peer: &Peer) {
            let _ = self.0.send(Seen::End);
        }
        fn on_close(&self, _peer: &Peer, had_error: bool) {
            let _ = self.0.send(Seen::Close(had_error));
        }
        fn on_timeout(&self, _peer: &Peer) {
            let _ = self.0.send(Seen::Timeout);
        }
        fn on_error(&self, _peer: &Peer, error: HachiError) {
            let _ = self.0.send(Seen::Error(error.to_string()));
        }
    }

    fn spawn_peer(config: PeerConfig) -> (Peer, DuplexStream, mpsc::UnboundedReceiver<Seen>) {
        let (local, remote) = duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::spawn(local, "peer-1", None, &config, Arc::new(Recorder(tx)));
        (peer, remote, rx)
    }

    #[tokio::test]
    async fn test_connected_then_message() {
        let (_peer, mut remote, mut rx) = spawn_peer(PeerConfig::default());

        let header = Header::with_transaction("GREETINGS");
        remote
            .write_all(&encode(&header, b"Hello World!").unwrap())
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::Connected(id)) if id == "peer-1"));
        match rx.recv().await {
            Some(Seen::Message(h, payload)) => {
                assert_eq!(h, header);
                assert_eq!(&payload[..], b"Hello World!");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_never_surfaces() {
        let (_peer, mut remote, mut rx) = spawn_peer(PeerConfig::default());

        let mut data = encode(&Header::heartbeat(), b"").unwrap().to_vec();
        data.extend_from_slice(&encode(&Header::with_transaction("REAL"), b"x").unwrap());
        remote.write_all(&data).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        match rx.recv().await {
            Some(Seen::Message(h, _)) => assert_eq!(h.transaction(), Some("REAL")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_header_is_dropped_not_fatal() {
        let (peer, mut remote, mut rx) = spawn_peer(PeerConfig::default());

        let mut data = crate::protocol::encode_raw(WireVersion::Current, b"{oops", b"lost")
            .unwrap()
            .to_vec();
        data.extend_from_slice(&encode(&Header::with_transaction("AFTER"), b"kept").unwrap());
        remote.write_all(&data).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        match rx.recv().await {
            Some(Seen::Message(h, payload)) => {
                assert_eq!(h.transaction(), Some("AFTER"));
                assert_eq!(&payload[..], b"kept");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_bad_magic_sends_diagnostic_and_closes() {
        let (peer, mut remote, mut rx) = spawn_peer(PeerConfig::default());

        remote.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut reply = Vec::new();
        remote.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, PROTOCOL_PROBLEM_LINE);

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        assert!(matches!(rx.recv().await, Some(Seen::Error(e)) if e.contains("Protocol violation")));
        assert!(matches!(rx.recv().await, Some(Seen::Close(true))));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_remote_end_emits_end_then_close() {
        let (_peer, remote, mut rx) = spawn_peer(PeerConfig::default());
        drop(remote);

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        assert!(matches!(rx.recv().await, Some(Seen::End)));
        assert!(matches!(rx.recv().await, Some(Seen::Close(false))));
    }

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let (peer, mut remote, _rx) = spawn_peer(PeerConfig::default());

        let header = Header::with_transaction("GREETINGS");
        peer.send_confirmed(&header, "Hello World!").await.unwrap();

        let expected = encode(&header, b"Hello World!").unwrap();
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_send_after_close_reports_error() {
        let (peer, _remote, mut rx) = spawn_peer(PeerConfig::default());

        peer.close();
        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        assert!(matches!(rx.recv().await, Some(Seen::Close(false))));

        // Plain send is a logged no-op
        peer.send(&Header::with_transaction("LATE"), b"x");

        let result = peer.send_confirmed(&Header::with_transaction("LATE"), b"x").await;
        assert!(matches!(result, Err(HachiError::WriteOnClosedPeer(id)) if id == "peer-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_keeps_connection_open() {
        let config = PeerConfig {
            idle_timeout: Some(Duration::from_secs(5)),
            ..PeerConfig::default()
        };
        let (peer, mut remote, mut rx) = spawn_peer(config);

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        assert!(matches!(rx.recv().await, Some(Seen::Timeout)));
        assert!(matches!(rx.recv().await, Some(Seen::Timeout)));
        assert!(!peer.is_closed());

        remote
            .write_all(&encode(&Header::with_transaction("LATE"), b"").unwrap())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Message(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_traffic_defers_idle_timeout() {
        let config = PeerConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..PeerConfig::default()
        };
        let (peer, _remote, mut rx) = spawn_peer(config);
        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));

        // Nothing arrives, but a frame leaves every 30ms
        for _ in 0..20 {
            peer.send_confirmed(&Header::with_transaction("APP"), b"tick")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(rx.try_recv().is_err());

        // Once sending stops the timeout fires again
        assert!(matches!(rx.recv().await, Some(Seen::Timeout)));
    }

    struct BrokenWrites(DuplexStream);

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_emits_error_then_close() {
        // The remote end stays open, so only the write side fails
        let (local, _remote) = duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::spawn(
            BrokenWrites(local),
            "peer-1",
            None,
            &PeerConfig::default(),
            Arc::new(Recorder(tx)),
        );
        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));

        peer.send(&Header::with_transaction("LOST"), b"x");

        assert!(matches!(rx.recv().await, Some(Seen::Error(e)) if e.contains("broken pipe")));
        assert!(matches!(rx.recv().await, Some(Seen::Close(true))));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_legacy_peer_round_trip() {
        let config = PeerConfig {
            wire_version: WireVersion::Legacy,
            ..PeerConfig::default()
        };
        let (peer, mut remote, mut rx) = spawn_peer(config);

        let header = Header::with_transaction("OLD");
        let bytes = encode_with(WireVersion::Legacy, &header, b"v0").unwrap();
        remote.write_all(&bytes).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::Connected(_))));
        assert!(matches!(rx.recv().await, Some(Seen::Message(h, _)) if h == header));

        peer.send_confirmed(&header, b"v0").await.unwrap();
        let mut buf = vec![0u8; bytes.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &bytes[..]);
    }
}
