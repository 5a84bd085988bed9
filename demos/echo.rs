//! Echo server over the connection pool.
//!
//! Demonstrates:
//! - Accepting WebSocket peers with `WsListener`
//! - Registering each peer in a `ConnectionPool` under its socket address
//! - Echoing every non-ping frame back by id
//! - Observing closes through a pool close callback
//!
//! Peers must send the ping sentinel (`.`) at least every `--ping-wait`
//! seconds or they are disconnected.
//!
//! Usage:
//!   cargo run --example echo
//!   cargo run --example echo -- --port 9000
//!   cargo run --example echo -- --ping-wait 5 --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use ws_connpool::{Connection, ConnectionOptions, ConnectionPool, WsListener};

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
    ping_wait: u64,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };

        let port = match value_of("--port") {
            Some(port) => port.parse().context("--port must be a number")?,
            None => 9000,
        };
        let ping_wait = match value_of("--ping-wait") {
            Some(secs) => secs.parse().context("--ping-wait must be a number")?,
            None => 20,
        };

        Ok(Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
            ping_wait,
        })
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "ws_connpool=debug,echo=debug"
    } else {
        "ws_connpool=info,echo=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            std::process::exit(2);
        }
    };
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== Echo Server ===\n");

    let options = ConnectionOptions::new().with_ping_wait(Duration::from_secs(args.ping_wait));
    options.validate().context("invalid --ping-wait")?;

    // ========================================================================
    // Pool
    // ========================================================================

    let pool = ConnectionPool::new();

    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
    pool.set_receive_callback(move |payload: Vec<u8>, id: &str| {
        let _ = echo_tx.send((id.to_string(), payload));
    });

    pool.add_close_callback(Some(Arc::new(|id: &str| {
        println!("[Close] {id} disconnected");
    })))?;

    let echo_pool = Arc::clone(&pool);
    let echo_task = tokio::spawn(async move {
        while let Some((id, payload)) = echo_rx.recv().await {
            if let Err(e) = echo_pool.send(&payload, &id).await {
                tracing::warn!(connection_id = %id, error = %e, "Echo failed");
            }
        }
    });

    // ========================================================================
    // Listener
    // ========================================================================

    let listener = WsListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), args.port)
        .await
        .context("failed to bind listener")?;
    println!("[Listen] {}", listener.ws_url());
    println!("Press Ctrl+C to exit...\n");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (transport, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };

                let id = addr.to_string();
                let connection =
                    Connection::with_options(Some(Arc::new(transport)), &id, options.clone())?;
                if let Err(e) = pool.register(Some(connection), &id) {
                    tracing::warn!(connection_id = %id, error = %e, "Register failed");
                    continue;
                }
                println!("[Open] {id} ({} connected)", pool.connection_count());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\n[Shutdown] closing {} connections", pool.connection_count());
    pool.shutdown().await;
    echo_task.abort();

    Ok(())
}
