//! # Duplex CLI Entry Point
//!
//! Demo peer for the duplex transport. One process listens and echoes every
//! frame back on the connection it arrived on; another dials it, sends a few
//! frames and prints what comes back over the same socket.
//!
//! ## Usage
//!
//! ```bash
//! # Start an echoing peer on port 7000
//! duplex listen -p 7000
//!
//! # Dial it and send two frames
//! duplex dial 127.0.0.1:7000 -m hello -m world
//!
//! # Use a JSON configuration file (missing fields take defaults)
//! duplex listen --config duplex.json
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use duplex_common::{Frame, TransportConfig};
use duplex_transport::{Connection, DuplexTransport};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// Duplex - full-duplex RPC transport demo peer
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Listen(ListenArgs),
    Dial(DialArgs),
}

/// Arguments for running an echoing peer.
///
/// # Example
///
/// ```bash
/// duplex listen -p 7000 --connect 10.0.0.2:7000
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
/// listen for peers and echo every frame back
struct ListenArgs {
    /// port to listen on
    ///
    /// Overrides `listen_port` from the configuration. 0 picks a free port.
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// path to a JSON configuration file
    #[argh(option)]
    config: Option<String>,

    /// peer to dial at startup, so frames also flow over an outbound socket
    #[argh(option)]
    connect: Vec<String>,
}

/// Arguments for dialing a peer and sending frames.
///
/// Every frame received before the wait expires is printed on its own line,
/// followed by the connection statistics as JSON.
#[derive(FromArgs)]
#[argh(subcommand, name = "dial")]
/// dial a peer, send frames and print the replies
struct DialArgs {
    /// address of the peer (host:port)
    #[argh(positional)]
    address: String,

    /// frame payload to send; may be repeated
    #[argh(option, short = 'm', long = "message")]
    messages: Vec<String>,

    /// how long to wait for replies, in milliseconds
    #[argh(option, long = "wait-ms", default = "1000")]
    wait_ms: u64,

    /// path to a JSON configuration file
    #[argh(option)]
    config: Option<String>,
}

fn load_config(path: Option<&str>) -> Result<TransportConfig> {
    match path {
        Some(path) => TransportConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => Ok(TransportConfig::default()),
    }
}

fn messages_or_default(messages: Vec<String>) -> Vec<String> {
    if messages.is_empty() {
        vec!["hello".to_string()]
    } else {
        messages
    }
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Listen(args) => run_listen(args),
        Commands::Dial(args) => run_dial(args),
    }
}

fn run_listen(args: ListenArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let port = args.port.unwrap_or(config.listen_port);

    let transport = DuplexTransport::new(config, |connection: &Arc<Connection>, frame: Frame| {
        tracing::info!(
            connection = %connection.id(),
            peer = %connection.remote_id(),
            bytes = frame.len(),
            "Echoing frame"
        );
        connection.send_frame(frame.as_bytes())
    })?;

    let bound = transport.listen(port)?;
    tracing::info!("Listening on {}", bound);
    println!("{}", serde_json::to_string_pretty(transport.identity().as_ref())?);

    for address in &args.connect {
        match transport.dial(address) {
            Ok(connection) => tracing::info!("Connected to {} ({})", address, connection.remote_id()),
            Err(e) => tracing::warn!("Failed to connect to {}: {}", address, e),
        }
    }

    // Serve until the process is killed
    loop {
        std::thread::park();
    }
}

fn run_dial(args: DialArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let transport = DuplexTransport::new(config, move |_: &Arc<Connection>, frame: Frame| -> duplex_common::Result<()> {
        let _ = tx
            .lock()
            .map(|tx| tx.send(frame.into_bytes()));
        Ok(())
    })?;

    let connection = transport
        .dial(&args.address)
        .with_context(|| format!("Failed to dial {}", args.address))?;
    tracing::info!("Connected to {} ({})", args.address, connection.remote_id());

    for message in messages_or_default(args.messages) {
        connection.send_frame(message.as_bytes())?;
    }

    let deadline = Instant::now() + Duration::from_millis(args.wait_ms);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
            Err(_) => break,
        }
    }

    println!("{}", serde_json::to_string(&connection.stats())?);
    transport.close();
    Ok(())
}
