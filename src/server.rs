//! Listening side: accepts connections and wraps each one in a [`Peer`].
//!
//! Every accepted connection gets its own [`Peer`] with a fresh random id.
//! Lifecycle and data from all peers are funnelled into one event channel,
//! read with [`Server::next_event`].
//!
//! # Example
//!
//! ```ignore
//! use hachi_nio::{Header, Server, ServerEvent};
//!
//! let mut server = Server::builder(4000).bind().await?;
//! while let Some(event) = server.next_event().await {
//!     if let ServerEvent::Data { peer, .. } = event {
//!         peer.send(&Header::with_transaction("GREETINGS"), "Hello World!");
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::error::{HachiError, Result};
use crate::header::Header;
use crate::id::generate_peer_id;
use crate::peer::{ConnectionEvents, Peer, PeerConfig};
use crate::protocol::WireVersion;

/// Address bound when none is given.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Time an accepted TLS connection gets to finish its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that happened on the server or one of its peers.
#[derive(Debug)]
pub enum ServerEvent {
    /// The listener is bound.
    Listening(SocketAddr),
    /// A connection was accepted (after the TLS handshake, if any).
    ClientConnected(Peer),
    /// A complete application message arrived.
    Data {
        peer: Peer,
        header: Header,
        payload: Bytes,
    },
    /// The remote side finished sending.
    ClientEnd(Peer),
    /// The connection is fully closed.
    ClientClose { peer: Peer, had_error: bool },
    /// The connection went quiet for the idle duration.
    ClientTimeout(Peer),
    /// The connection failed or broke the protocol.
    ClientError { peer: Peer, error: HachiError },
    /// Listener-level failure (accept or TLS handshake).
    Error(HachiError),
}

/// Builder for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    host: String,
    port: u16,
    tls: Option<Arc<rustls::ServerConfig>>,
    handshake_timeout: Duration,
    peer_config: PeerConfig,
}

impl ServerBuilder {
    /// Listen on `port` on all interfaces. Port 0 picks a free port.
    pub fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_BIND_HOST.to_string(),
            port,
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_config: PeerConfig::default(),
        }
    }

    /// Bind to a specific address instead of all interfaces.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Accept TLS connections with this configuration.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Drop TLS connections that have not completed the handshake in time.
    ///
    /// Default: [`DEFAULT_HANDSHAKE_TIMEOUT`]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Emit [`ServerEvent::ClientTimeout`] after this long with no data read or written.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.peer_config.idle_timeout = Some(timeout);
        self
    }

    /// Frame layout spoken by every accepted peer.
    ///
    /// Default: [`WireVersion::Current`]
    pub fn wire_version(mut self, version: WireVersion) -> Self {
        self.peer_config.wire_version = version;
        self
    }

    /// Largest inbound frame accepted before the peer is dropped.
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.peer_config.max_frame_size = max;
        self
    }

    /// Socket read buffer size per peer.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.peer_config.read_buffer_size = size;
        self
    }

    /// Bind the listener and start accepting.
    ///
    /// The first event is always [`ServerEvent::Listening`].
    pub async fn bind(self) -> Result<Server> {
        if self.peer_config.read_buffer_size == 0 {
            return Err(HachiError::InvalidConfig(
                "read buffer size must be non-zero".to_string(),
            ));
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, tls = self.tls.is_some(), "server listening");

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerEvent::Listening(local_addr));

        let acceptor = self
            .tls
            .map(|config| (TlsAcceptor::from(config), self.handshake_timeout));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::new(self.peer_config),
            tx,
        ));

        Ok(Server {
            local_addr,
            events: rx,
            accept_task,
        })
    }
}

/// A bound, accepting server.
///
/// Dropping the server stops accepting. Peers already connected keep running
/// until they close.
pub struct Server {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder(port: u16) -> ServerBuilder {
        ServerBuilder::new(port)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the server has stopped and every peer is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        tracing::debug!(addr = %self.local_addr, "server shutting down");
        self.accept_task.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<(TlsAcceptor, Duration)>,
    config: Arc<PeerConfig>,
    tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let events: Arc<dyn ConnectionEvents> = Arc::new(ServerForwarder { tx: tx.clone() });

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    acceptor.clone(),
                    config.clone(),
                    events.clone(),
                    tx.clone(),
                ));
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                if tx.send(ServerEvent::Error(e.into())).is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<(TlsAcceptor, Duration)>,
    config: Arc<PeerConfig>,
    events: Arc<dyn ConnectionEvents>,
    tx: mpsc::UnboundedSender<ServerEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(remote = %addr, error = %e, "failed to set TCP_NODELAY");
    }

    let id = generate_peer_id();
    match acceptor {
        None => {
            Peer::spawn(stream, id, Some(addr), &config, events);
        }
        Some((acceptor, handshake_timeout)) => {
            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    Peer::spawn(tls_stream, id, Some(addr), &config, events);
                }
                Ok(Err(e)) => {
                    tracing::warn!(remote = %addr, error = %e, "TLS handshake failed");
                    let _ = tx.send(ServerEvent::Error(HachiError::Tls(e.to_string())));
                }
                Err(_) => {
                    tracing::warn!(remote = %addr, timeout = ?handshake_timeout, "TLS handshake timed out");
                    let _ = tx.send(ServerEvent::Error(HachiError::Tls(format!(
                        "TLS handshake timed out after {:?}",
                        handshake_timeout
                    ))));
                }
            }
        }
    }
}

/// Forwards peer callbacks into the server's event channel.
struct ServerForwarder {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerForwarder {
    fn emit(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("server dropped, discarding event");
        }
    }
}

impl ConnectionEvents for ServerForwarder {
    fn on_connected(&self, peer: &Peer) {
        self.emit(ServerEvent::ClientConnected(peer.clone()));
    }

    fn on_message(&self, peer: &Peer, header: Header, payload: Bytes) {
        self.emit(ServerEvent::Data {
            peer: peer.clone(),
            header,
            payload,
        });
    }

    fn on_end(&self, peer: &Peer) {
        self.emit(ServerEvent::ClientEnd(peer.clone()));
    }

    fn on_close(&self, peer: &Peer, had_error: bool) {
        self.emit(ServerEvent::ClientClose {
            peer: peer.clone(),
            had_error,
        });
    }

    fn on_timeout(&self, peer: &Peer) {
        self.emit(ServerEvent::ClientTimeout(peer.clone()));
    }

    fn on_error(&self, peer: &Peer, error: HachiError) {
        self.emit(ServerEvent::ClientError {
            peer: peer.clone(),
            error,
        });
    }
}
