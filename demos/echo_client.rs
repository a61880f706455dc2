//! Echo client: sends one GREETINGS message and prints what comes back.
//!
//! Run with:
//! ```text
//! cargo run --example echo_client -- --host 127.0.0.1 --port 7890
//! cargo run --example echo_client -- --port 7890 --tls --insecure
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hachi_nio::{Client, ClientEvent, ClientTls, Header, ServerVerification};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "echo_client")]
#[command(about = "Frame echo client", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, default_value = "7890")]
    port: u16,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// PEM file with the CA that signed the server certificate
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip server certificate verification
    #[arg(long)]
    insecure: bool,

    /// Seconds of silence before a heartbeat is sent
    #[arg(long, default_value = "10")]
    idle_secs: u64,
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
    let mut builder =
        Client::builder(args.host.clone(), args.port).idle_timeout(Duration::from_secs(args.idle_secs));

    if args.tls {
        let verification = match (&args.ca, args.insecure) {
            (_, true) => ServerVerification::Disabled,
            (Some(ca), false) => ServerVerification::CaPem(std::fs::read(ca)?),
            (None, false) => return Err("--tls needs either --ca or --insecure".into()),
        };
        builder = builder.tls(ClientTls::with_verification(verification, &args.host)?);
    }

    let mut client = builder.connect().await?;

    while let Some(event) = client.next_event().await {
        match event {
            ClientEvent::ClientConnected(peer) => {
                println!("Connected on the server");
                peer.send(&Header::with_transaction("GREETINGS"), "Hello World!");
            }
            ClientEvent::Data { payload, .. } => {
                println!("{}", String::from_utf8_lossy(&payload));
            }
            ClientEvent::ClientEnd(_) => println!("end"),
            ClientEvent::ClientClose { had_error, .. } => {
                println!("close {}", had_error);
                break;
            }
            ClientEvent::ClientError { error, .. } => println!("error {}", error),
            ClientEvent::ClientTimeout(_) => {}
        }
    }

    Ok(())
}
