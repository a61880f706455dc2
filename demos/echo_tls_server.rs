//! TLS variant of the echo server. Key and certificate are read from PEM files.
//!
//! Run with:
//! ```text
//! cargo run --example echo_tls_server -- --cert server-crt.pem --key server-key.pem
//! ```

use std::path::PathBuf;

use clap::Parser;
use hachi_nio::tls::server_config_from_pem;
use hachi_nio::{Server, ServerEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "echo_tls_server")]
#[command(about = "Frame echo server over TLS", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "7890")]
    port: u16,

    /// PEM certificate chain
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key
    #[arg(long)]
    key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    let cert = std::fs::read(&args.cert)?;
    let key = std::fs::read(&args.key)?;
    let tls = server_config_from_pem(&cert, &key)?;

    let mut server = Server::builder(args.port).tls(tls).bind().await?;

    while let Some(event) = server.next_event().await {
        match event {
            ServerEvent::Listening(addr) => {
                println!("Server is up on {}! Now waiting for connections", addr);
            }
            ServerEvent::ClientConnected(peer) => {
                println!(
                    "NEW CLIENT CONNECTED!\tid: {} origin: {:?}",
                    peer.id(),
                    peer.remote_addr()
                );
            }
            ServerEvent::ClientClose { peer, .. } => {
                println!("CLIENT DISCONNECTED!\tid: {}", peer.id());
            }
            ServerEvent::Data {
                peer,
                header,
                payload,
            } => {
                println!(
                    "MESSAGE RECEIVED!\tid: {} message: {}",
                    peer.id(),
                    String::from_utf8_lossy(&payload)
                );
                peer.send(&header, "Hello World!");
            }
            ServerEvent::Error(error) => eprintln!("SERVER ERROR! {}", error),
            _ => {}
        }
    }

    Ok(())
}
