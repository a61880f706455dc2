//! Connecting side: one outbound connection with heartbeat keep-alive.
//!
//! The [`ClientBuilder`] provides a fluent API for the target address and
//! connection options. The [`Client`] manages the lifecycle:
//! 1. Connect (and run the TLS handshake, if configured)
//! 2. Wrap the stream in a [`Peer`]
//! 3. Send a heartbeat every time the connection goes idle
//! 4. Reconnect on demand, keeping the same event stream
//!
//! # Example
//!
//! ```ignore
//! use hachi_nio::{Client, ClientEvent, Header};
//!
//! let mut client = Client::builder("localhost", 4000)
//!     .idle_timeout(std::time::Duration::from_secs(10))
//!     .connect()
//!     .await?;
//!
//! client.send(&Header::with_transaction("GREETINGS"), "Hello World!");
//! while let Some(event) = client.next_event().await {
//!     if let ClientEvent::Data { payload, .. } = event {
//!         println!("{}", String::from_utf8_lossy(&payload));
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::error::{HachiError, Result};
use crate::header::Header;
use crate::id::generate_peer_id;
use crate::peer::{ConnectionEvents, Peer, PeerConfig};
use crate::protocol::WireVersion;
use crate::tls::{client_config, server_name, ServerVerification};

/// TLS settings for an outbound connection.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl ClientTls {
    /// Use an existing client configuration, checking the certificate against `host`.
    pub fn new(config: Arc<rustls::ClientConfig>, host: &str) -> Result<Self> {
        Ok(Self {
            config,
            server_name: server_name(host)?,
        })
    }

    /// Build the configuration from a verification policy.
    pub fn with_verification(verification: ServerVerification, host: &str) -> Result<Self> {
        Self::new(client_config(verification)?, host)
    }
}

/// Something that happened on the client's connection.
#[derive(Debug)]
pub enum ClientEvent {
    /// The connection is established (after the TLS handshake, if any).
    ClientConnected(Peer),
    /// A complete application message arrived.
    Data {
        peer: Peer,
        header: Header,
        payload: Bytes,
    },
    /// The server finished sending.
    ClientEnd(Peer),
    /// The connection is fully closed.
    ClientClose { peer: Peer, had_error: bool },
    /// The connection went idle; a heartbeat has been sent.
    ClientTimeout(Peer),
    /// The connection failed or broke the protocol.
    ClientError { peer: Peer, error: HachiError },
}

/// Builder for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    host: String,
    port: u16,
    tls: Option<ClientTls>,
    peer_config: PeerConfig,
}

impl ClientBuilder {
    /// Target `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            peer_config: PeerConfig::default(),
        }
    }

    /// Connect over TLS.
    pub fn tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Send a heartbeat after this long without traffic in either direction.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.peer_config.idle_timeout = Some(timeout);
        self
    }

    /// Frame layout spoken on the connection.
    ///
    /// Default: [`WireVersion::Current`]
    pub fn wire_version(mut self, version: WireVersion) -> Self {
        self.peer_config.wire_version = version;
        self
    }

    /// Largest inbound frame accepted before the connection is dropped.
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.peer_config.max_frame_size = max;
        self
    }

    /// Socket read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.peer_config.read_buffer_size = size;
        self
    }

    /// Connect and start reading.
    pub async fn connect(self) -> Result<Client> {
        if self.peer_config.read_buffer_size == 0 {
            return Err(HachiError::InvalidConfig(
                "read buffer size must be non-zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let events: Arc<dyn ConnectionEvents> = Arc::new(ClientForwarder { tx });
        let peer = open(&self, events.clone()).await?;

        Ok(Client {
            settings: self,
            peer,
            events,
            rx,
        })
    }
}

/// A connected client.
///
/// Events from every connection this client has opened, including ones
/// replaced by [`Client::reconnect`], arrive on the same stream.
pub struct Client {
    settings: ClientBuilder,
    peer: Peer,
    events: Arc<dyn ConnectionEvents>,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(host: impl Into<String>, port: u16) -> ClientBuilder {
        ClientBuilder::new(host, port)
    }

    /// The current connection.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Send a frame on the current connection (fire-and-forget).
    pub fn send(&self, header: &Header, payload: impl AsRef<[u8]>) {
        self.peer.send(header, payload);
    }

    /// Send a frame and report the write outcome to `callback`.
    pub fn send_with<F>(&self, header: &Header, payload: impl AsRef<[u8]>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.peer.send_with(header, payload, callback);
    }

    /// Send a frame and wait until it has been written.
    pub async fn send_confirmed(&self, header: &Header, payload: impl AsRef<[u8]>) -> Result<()> {
        self.peer.send_confirmed(header, payload).await
    }

    /// Drop the current connection and open a new one with the same settings.
    ///
    /// On failure the old connection is already closed and stays the current
    /// peer; calling `reconnect` again retries.
    pub async fn reconnect(&mut self) -> Result<()> {
        tracing::debug!(peer = %self.peer.id(), "reconnecting");
        self.peer.close();
        self.peer = open(&self.settings, self.events.clone()).await?;
        Ok(())
    }

    /// Close the current connection.
    pub fn close(&self) {
        self.peer.close();
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("peer", &self.peer)
            .finish()
    }
}

async fn open(settings: &ClientBuilder, events: Arc<dyn ConnectionEvents>) -> Result<Peer> {
    let stream = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
    let remote_addr = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
    }

    let id = generate_peer_id();
    let peer = match &settings.tls {
        None => Peer::spawn(stream, id, remote_addr, &settings.peer_config, events),
        Some(tls) => {
            let connector = TlsConnector::from(tls.config.clone());
            let tls_stream = connector
                .connect(tls.server_name.clone(), stream)
                .await
                .map_err(|e| HachiError::Tls(e.to_string()))?;
            Peer::spawn(tls_stream, id, remote_addr, &settings.peer_config, events)
        }
    };

    tracing::info!(
        peer = %peer.id(),
        host = %settings.host,
        port = settings.port,
        tls = settings.tls.is_some(),
        "client connected"
    );
    Ok(peer)
}

/// Forwards peer callbacks into the client's event channel and keeps the
/// connection alive.
struct ClientForwarder {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientForwarder {
    fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("client dropped, discarding event");
        }
    }
}

impl ConnectionEvents for ClientForwarder {
    fn on_connected(&self, peer: &Peer) {
        self.emit(ClientEvent::ClientConnected(peer.clone()));
    }

    fn on_message(&self, peer: &Peer, header: Header, payload: Bytes) {
        self.emit(ClientEvent::Data {
            peer: peer.clone(),
            header,
            payload,
        });
    }

    fn on_end(&self, peer: &Peer) {
        self.emit(ClientEvent::ClientEnd(peer.clone()));
    }

    fn on_close(&self, peer: &Peer, had_error: bool) {
        self.emit(ClientEvent::ClientClose {
            peer: peer.clone(),
            had_error,
        });
    }

    fn on_timeout(&self, peer: &Peer) {
        let heartbeat = Header::heartbeat();
        tracing::debug!(peer = %peer.id(), id = ?heartbeat.id(), "idle, sending heartbeat");
        peer.send(&heartbeat, b"");
        self.emit(ClientEvent::ClientTimeout(peer.clone()));
    }

    fn on_error(&self, peer: &Peer, error: HachiError) {
        self.emit(ClientEvent::ClientError {
            peer: peer.clone(),
            error,
        });
    }
}
