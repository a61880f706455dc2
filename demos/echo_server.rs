//! Echo server: answers every message with "Hello World!" under the same header.
//!
//! Run with:
//! ```text
//! RUST_LOG=hachi_nio=trace cargo run --example echo_server -- --port 7890
//! ```

use clap::Parser;
use hachi_nio::{Server, ServerEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "echo_server")]
#[command(about = "Frame echo server", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "7890")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = hachi_nio::DEFAULT_BIND_HOST)]
    host: String,
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
    let mut server = Server::builder(args.port).host(args.host).bind().await?;

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
            ServerEvent::ClientError { peer, error } => {
                eprintln!("CLIENT ERROR!\tid: {} error: {}", peer.id(), error);
            }
            ServerEvent::Error(error) => eprintln!("SERVER ERROR! {}", error),
            ServerEvent::ClientEnd(_) | ServerEvent::ClientTimeout(_) => {}
        }
    }

    Ok(())
}
