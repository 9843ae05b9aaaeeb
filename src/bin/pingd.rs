//! Ping server on the completion backend.
//!
//! Configuration comes from the environment:
//!   SHARDIO_ADDR    listen address, default 0.0.0.0:6380
//!   SHARDIO_LINKED  set to 1 to fuse the readiness poll and the recv into a linked chain

use std::{env, net::SocketAddr, thread};

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shardio::{
    error::Result,
    server::{Protocol, UringServer},
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr: SocketAddr = env::var("SHARDIO_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:6380".to_string())
        .parse()
        .expect("SHARDIO_ADDR must be host:port");
    let linked = env::var("SHARDIO_LINKED").map(|v| v == "1").unwrap_or(false);

    let server = UringServer::bind(addr, Protocol::Ping, linked)?;
    let shutdown = server.shutdown_handle();

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("failed to install signal handler");
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(sig, "signal received, shutting down");
            shutdown.request();
        }
    });

    match server.run() {
        Ok(served) => {
            info!(served, "bye");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "engine failed");
            Err(e)
        }
    }
}
