//! Echo and ping servers over both engine backends.
//!
//! [UringServer] runs on the completion backend: one thread, one ring, connections as
//! registered operations. The [session] module provides the same protocols as spawned tasks
//! on the readiness backend.

mod acceptor;
mod conn;
mod protocol;
pub mod session;

use std::{
    cell::RefCell,
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use io_uring::{opcode, types};
use nix::libc;
use tracing::{debug, info};

use crate::{
    error::Result,
    net::{listener_socket, WakeFd},
    proactor::{OpHandler, OpStatus, Proactor, SqeSink},
    registry::Registry,
    stats::ServedCounter,
};

pub use acceptor::AcceptOp;
pub use conn::{ConnOp, ConnState, Connection, NextIo};
pub use protocol::Protocol;

const RING_ENTRIES: u32 = 1024;

/// State shared by the engine loop and its operation handlers: the connection registry, the
/// admission queue of freshly accepted sockets, the served counter and the shutdown flag.
pub struct ShardCtx {
    pub registry: RefCell<Registry<Connection>>,
    pub pending: RefCell<Vec<OwnedFd>>,
    pub served: ServedCounter,
    shutdown: Arc<AtomicBool>,
}

impl ShardCtx {
    pub fn new() -> ShardCtx {
        ShardCtx {
            registry: RefCell::new(Registry::new()),
            pending: RefCell::new(Vec::new()),
            served: ServedCounter::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for ShardCtx {
    fn default() -> Self {
        ShardCtx::new()
    }
}

/// Keeps a poll armed on the wake eventfd so a foreign thread can knock the engine out of its
/// completion wait. Retires itself once shutdown is observed.
struct WakeOp {
    ctx: Rc<ShardCtx>,
    wake: Arc<WakeFd>,
}

impl OpHandler for WakeOp {
    fn prepare(&mut self, sink: &mut SqeSink) {
        let poll =
            opcode::PollAdd::new(types::Fd(self.wake.as_raw_fd()), libc::POLLIN as u32).build();
        sink.submit(poll);
    }

    fn complete(&mut self, _res: i32) -> OpStatus {
        self.wake.drain();
        if self.ctx.is_shutdown() {
            OpStatus::Release
        } else {
            OpStatus::Rearm
        }
    }
}

/// Cross-thread stop control for a [UringServer]: raises the flag, then pokes the eventfd so
/// the engine notices without waiting out its tick.
#[derive(Clone)]
pub struct UringShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<WakeFd>,
}

impl UringShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.wake.wake();
    }
}

/// Single-threaded server on the completion backend.
pub struct UringServer {
    proactor: Proactor,
    ctx: Rc<ShardCtx>,
    listener: Option<OwnedFd>,
    local_addr: SocketAddr,
    wake: Arc<WakeFd>,
    proto: Protocol,
    linked: bool,
}

impl UringServer {
    /// Bind `addr` and set up the engine. `linked` selects fused poll+recv chains instead of
    /// separate poll and recv round trips.
    pub fn bind(addr: SocketAddr, proto: Protocol, linked: bool) -> Result<UringServer> {
        let (listener, local_addr) = listener_socket(addr)?;
        Ok(UringServer {
            proactor: Proactor::new(RING_ENTRIES)?,
            ctx: Rc::new(ShardCtx::new()),
            listener: Some(listener),
            local_addr,
            wake: Arc::new(WakeFd::new()?),
            proto,
            linked,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn served(&self) -> u64 {
        self.ctx.served.get()
    }

    pub fn shutdown_handle(&self) -> UringShutdownHandle {
        UringShutdownHandle {
            flag: self.ctx.shutdown.clone(),
            wake: self.wake.clone(),
        }
    }

    /// Run until shutdown is requested and every live connection has drained. Returns the
    /// total number of requests served.
    pub fn run(mut self) -> Result<u64> {
        let listener_fd = self
            .listener
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or(-1);
        info!(addr = %self.local_addr, proto = ?self.proto, linked = self.linked, "serving");

        self.proactor.submit(Box::new(WakeOp {
            ctx: self.ctx.clone(),
            wake: self.wake.clone(),
        }))?;
        self.proactor
            .submit(Box::new(AcceptOp::new(self.ctx.clone(), listener_fd)))?;

        loop {
            self.proactor.poll_and_dispatch()?;
            self.admit_pending()?;

            if self.ctx.is_shutdown() {
                if let Some(listener) = self.listener.take() {
                    drop(listener);
                    info!(
                        live = self.ctx.registry.borrow().len(),
                        "listener closed, draining"
                    );
                }
                if self.ctx.registry.borrow().is_empty() {
                    break;
                }
            }
        }

        let served = self.ctx.served.get();
        info!(served, "engine stopped");
        Ok(served)
    }

    /// Turn accepted sockets into registered connections. Runs between dispatch batches, so
    /// handler code never re-enters the table while it is being drained.
    fn admit_pending(&mut self) -> Result<()> {
        if self.ctx.pending.borrow().is_empty() {
            return Ok(());
        }
        let fds: Vec<OwnedFd> = self.ctx.pending.borrow_mut().drain(..).collect();
        for fd in fds {
            if self.ctx.is_shutdown() {
                // Accepted after the drain decision: closing immediately is the contract.
                continue;
            }
            let conn = Connection::new(fd, self.proto, self.linked);
            let token = self.ctx.registry.borrow_mut().insert(conn);
            self.proactor
                .submit(Box::new(ConnOp::new(self.ctx.clone(), token)))?;
            debug!(live = self.ctx.registry.borrow().len(), "connection admitted");
        }
        Ok(())
    }
}
