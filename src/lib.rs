//! # shardio
//!
//! A per-core asynchronous I/O engine for linux. One engine owns one OS thread and multiplexes
//! many connections over it; scaling out means running more engines on more cores, never
//! sharing connections between them. Two backends are provided behind the same scheduling
//! contract: a readiness reactor built on `epoll` via [mio], and a completion proactor built
//! directly on `io_uring`.
//!
//! On the reactor side, work is ordinary async tasks driven by a [executor::Shard]:
//!
//! ```no_run
//! use shardio::{executor::Shard, server::{session, Protocol}, stats::ServedCounter};
//!
//! fn main() -> shardio::error::Result<()> {
//!     let shard = Shard::new()?;
//!     let handle = shard.handle();
//!     let served = ServedCounter::new();
//!
//!     // Serve echo on port 9999 until a shutdown is requested, then drain.
//!     let addr = "0.0.0.0:9999".parse().unwrap();
//!     shard.run(session::serve(handle, addr, Protocol::Echo, served))??;
//!     Ok(())
//! }
//! ```
//!
//! On the proactor side, connections are operations registered in a table keyed by the ring's
//! user data, and the whole server is a flush/wait/dispatch loop:
//!
//! ```no_run
//! use shardio::server::{Protocol, UringServer};
//!
//! fn main() -> shardio::error::Result<()> {
//!     let server = UringServer::bind("0.0.0.0:6380".parse().unwrap(), Protocol::Ping, true)?;
//!     let shutdown = server.shutdown_handle();
//!     // Hand `shutdown` to a signal handler thread, then:
//!     let served = server.run()?;
//!     println!("served {served} requests");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod executor;
pub mod net;
pub mod proactor;
pub mod registry;
pub mod sched;
pub mod server;
pub mod stats;
pub mod sync;
pub mod task;

pub use error::{Error, Result};
