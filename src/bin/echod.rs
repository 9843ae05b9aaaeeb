//! Echo/ping server on the readiness backend, with a built-in load generation mode.
//!
//! Server (default):
//!   SHARDIO_ADDR   listen address, default 0.0.0.0:9999
//!   SHARDIO_PROTO  "echo" (default) or "ping"
//!
//! Client mode, enabled by setting SHARDIO_PEER:
//!   SHARDIO_PEER         server address to hammer
//!   SHARDIO_CONNECTIONS  concurrent connections, default 8
//!   SHARDIO_COUNT        round trips per connection, default 1000

use std::{env, net::SocketAddr, thread};

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardio::{
    error::Result,
    executor::Shard,
    server::{session, Protocol},
    stats::ServedCounter,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Ok(peer) = env::var("SHARDIO_PEER") {
        return run_clients(peer.parse().expect("SHARDIO_PEER must be host:port"));
    }

    let addr: SocketAddr = env::var("SHARDIO_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9999".to_string())
        .parse()
        .expect("SHARDIO_ADDR must be host:port");
    let proto = match env::var("SHARDIO_PROTO").as_deref() {
        Ok("ping") => Protocol::Ping,
        _ => Protocol::Echo,
    };

    let shard = Shard::new()?;
    let handle = shard.handle();
    let shutdown = handle.shutdown_handle();

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("failed to install signal handler");
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(sig, "signal received, shutting down");
            shutdown.request();
        }
    });

    let served = ServedCounter::new();
    let served_total = served.clone();
    shard.run(async move { session::serve(handle.clone(), addr, proto, served).await })??;
    info!(served = served_total.get(), "bye");
    Ok(())
}

fn run_clients(peer: SocketAddr) -> Result<()> {
    let connections: usize = env::var("SHARDIO_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);
    let count: usize = env::var("SHARDIO_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let shard = Shard::new()?;
    let handle = shard.handle();
    info!(%peer, connections, count, "starting client pool");

    let start = std::time::Instant::now();
    let total = shard.run(session::client_pool(handle, peer, connections, count))??;
    let elapsed = start.elapsed();
    info!(
        total,
        elapsed_ms = elapsed.as_millis() as u64,
        "client pool finished"
    );
    Ok(())
}
