//! isolink: echo server and probe client over real TCP.
//!
//! ```bash
//! # Terminal 1 - echo every request back with its response MTI
//! cargo run --bin isolink -- serve 127.0.0.1:8583
//!
//! # Terminal 2 - wait for an active session, then send 5 requests
//! cargo run --bin isolink -- probe 127.0.0.1:8583 5
//! ```

use std::env;
use std::time::Duration;

use isolink_transport::{
    BinaryCodec, ClientConfig, IsoClient, IsoMessage, IsoServer, ServerRequest, TokioProviders,
};
use tokio::task::LocalSet;

const DEFAULT_ADDR: &str = "127.0.0.1:8583";
const DEFAULT_PROBE_COUNT: u32 = 5;

// ============================================================================
// Server
// ============================================================================

async fn run_server(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(
        |request: ServerRequest<BinaryCodec>| {
            tracing::debug!(peer = %request.peer_addr(), "received {}", request.message());
            if let Err(e) = request.respond() {
                tracing::warn!(peer = %request.peer_addr(), "echo failed: {}", e);
            }
        },
    );

    let local_addr = server.listen(address).await?;
    tracing::info!("echo server listening on {}", local_addr);

    // Serve until killed.
    std::future::pending::<()>().await;
    Ok(())
}

// ============================================================================
// Probe
// ============================================================================

async fn run_probe(address: &str, count: u32) -> Result<(), Box<dyn std::error::Error>> {
    let config =
        ClientConfig::local_network(address).with_when_active_timeout(Duration::from_secs(10));
    let when_active_timeout = config.when_active_timeout;
    let mut client = IsoClient::new(TokioProviders::new(), BinaryCodec, config);

    client.when_active(when_active_timeout).await?;
    tracing::info!("session to {} is active", address);

    let mut success_count = 0;
    for seq in 0..count {
        let request = IsoMessage::new("0200")
            .with_field(11, format!("{:06}", seq))
            .with_field(1000, uuid::Uuid::new_v4().to_string());

        let started = tokio::time::Instant::now();
        match client.send(&request).await {
            Ok(reply) => {
                success_count += 1;
                tracing::info!(seq, rtt = ?started.elapsed(), "reply {}", reply);
            }
            Err(e) => {
                tracing::warn!(seq, "request failed: {}", e);
            }
        }
    }

    let metrics = client.metrics();
    tracing::info!(
        sent = metrics.requests_sent,
        timeouts = metrics.response_timeouts,
        "{}/{} probes answered",
        success_count,
        count
    );

    client.close().await;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn print_usage() {
    println!("isolink: ISO-8583 session tools\n");
    println!("Usage:");
    println!("  isolink serve [addr]           # Echo server (default {DEFAULT_ADDR})");
    println!("  isolink probe [addr] [count]   # Send count echo requests");
    println!("\nDefault count: {DEFAULT_PROBE_COUNT}");
}

fn main() {
    let _ = tracing_subscriber::fmt().try_init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let address = args.get(2).map(|s| s.as_str()).unwrap_or(DEFAULT_ADDR).to_string();

    let count = match args.get(3).map(|s| s.parse::<u32>()) {
        None => DEFAULT_PROBE_COUNT,
        Some(Ok(count)) => count,
        Some(Err(e)) => {
            eprintln!("Invalid count: {}", e);
            std::process::exit(1);
        }
    };

    // Current-thread runtime plus LocalSet, required for spawn_local
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    let local = LocalSet::new();

    match mode {
        "serve" => {
            local.block_on(&runtime, async {
                if let Err(e) = run_server(&address).await {
                    eprintln!("Server error: {}", e);
                    std::process::exit(1);
                }
            });
        }
        "probe" => {
            local.block_on(&runtime, async {
                if let Err(e) = run_probe(&address, count).await {
                    eprintln!("Probe error: {}", e);
                    std::process::exit(1);
                }
            });
        }
        _ => print_usage(),
    }
}
