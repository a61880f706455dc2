//! # hachi-nio
//!
//! Message framing transport over plain or TLS TCP byte streams.
//!
//! Every message is a frame carrying a JSON header document and an opaque
//! binary payload. Frames are reassembled from arbitrary chunk boundaries,
//! keep-alive heartbeats are exchanged automatically and never reach the
//! application.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): frame layout, stateless codec, reassembler
//! - **Peer** ([`Peer`]): one connection, its read task and writer task
//! - **Endpoints** ([`Server`], [`Client`]): accept or open connections and
//!   surface everything as typed events
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────┬──────────────┬───────────────┬────────────┬───────────┐
//! │ "HNIO"   │ total length │ header length │ header     │ payload   │
//! │ 4 bytes  │ i32 LE       │ i32 LE        │ JSON bytes │ raw bytes │
//! └──────────┴──────────────┴───────────────┴────────────┴───────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use hachi_nio::{Header, Server, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> hachi_nio::Result<()> {
//!     let mut server = Server::builder(4000).bind().await?;
//!
//!     while let Some(event) = server.next_event().await {
//!         if let ServerEvent::Data { peer, header, .. } = event {
//!             peer.send(&header, "Hello World!");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod protocol;
pub mod tls;
pub mod writer;

mod client;
mod header;
mod id;
mod peer;
mod server;

pub use client::{Client, ClientBuilder, ClientEvent, ClientTls};
pub use error::{HachiError, Result};
pub use header::{Header, HEARTBEAT_TRANSACTION};
pub use id::generate_id;
pub use peer::{ConnectionEvents, Peer, PeerConfig, DEFAULT_READ_BUFFER_SIZE};
pub use server::{
    Server, ServerBuilder, ServerEvent, DEFAULT_BIND_HOST, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use tls::ServerVerification;
