//! Protocol sessions on the readiness backend: an accept loop, per-connection tasks, and a
//! small client used for load generation. Everything here is plain async code on a
//! [crate::executor::Shard].

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    net::SocketAddr,
    rc::Rc,
};

use futures::future::{poll_fn, select, Either};
use futures::pin_mut;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::{
    error::Result,
    executor::{IoSource, ShardHandle},
    registry::Registry,
    sched::{READABLE, WRITABLE},
    stats::ServedCounter,
};

use super::Protocol;

type Sessions = Rc<RefCell<Registry<()>>>;

/// Bound listener waiting to serve. Separate from [Acceptor::serve] so callers can learn the
/// actual port before the accept loop starts, which matters when binding port zero.
pub struct Acceptor {
    shard: ShardHandle,
    listener: IoSource<TcpListener>,
    local_addr: SocketAddr,
}

impl Acceptor {
    pub fn bind(shard: ShardHandle, addr: SocketAddr) -> Result<Acceptor> {
        let listener = IoSource::new(shard.io(), TcpListener::bind(addr)?)?;
        let local_addr = listener.get_ref().local_addr()?;
        Ok(Acceptor {
            shard,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve `proto` until shutdown is requested, then drain: the listener closes
    /// immediately, live sessions run until their peers hang up.
    pub async fn serve(self, proto: Protocol, served: ServedCounter) -> Result<()> {
        let Acceptor {
            shard,
            listener,
            local_addr,
        } = self;
        let sessions: Sessions = Rc::new(RefCell::new(Registry::new()));
        info!(addr = %local_addr, proto = ?proto, "listening");

        loop {
            let readable = listener.readable();
            let stop = shard.shutdown_requested();
            pin_mut!(readable);
            pin_mut!(stop);
            if let Either::Right(_) = select(readable, stop).await {
                break;
            }

            loop {
                match listener.get_ref().accept() {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted");
                        spawn_session(&shard, &sessions, stream, proto, served.clone());
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        listener.clear_readiness(READABLE);
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        drop(listener);
        let live = sessions.borrow().len();
        info!(live, "listener closed, draining sessions");
        poll_fn(|cx| sessions.borrow_mut().poll_empty(cx)).await;
        Ok(())
    }
}

/// Bind and serve in one go; returns the bound address once the server has fully drained.
pub async fn serve(
    shard: ShardHandle,
    addr: SocketAddr,
    proto: Protocol,
    served: ServedCounter,
) -> Result<SocketAddr> {
    let acceptor = Acceptor::bind(shard.clone(), addr)?;
    let local_addr = acceptor.local_addr();
    acceptor.serve(proto, served).await?;
    Ok(local_addr)
}

fn spawn_session(
    shard: &ShardHandle,
    sessions: &Sessions,
    stream: TcpStream,
    proto: Protocol,
    served: ServedCounter,
) {
    let token = sessions.borrow_mut().insert(());
    let sessions = sessions.clone();
    let handle = shard.clone();
    shard.spawn(async move {
        if let Err(e) = session(&handle, stream, proto, &served).await {
            debug!(error = %e, "session ended with error");
        }
        sessions.borrow_mut().remove(token);
    });
}

/// One connection: read until would-block, decode, reply, repeat until EOF.
async fn session(
    shard: &ShardHandle,
    stream: TcpStream,
    proto: Protocol,
    served: &ServedCounter,
) -> io::Result<()> {
    let src = IoSource::new(shard.io(), stream)?;
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    let mut reply = Vec::new();

    'outer: loop {
        src.readable().await;
        let mut eof = false;
        loop {
            match src.get_ref().read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    src.clear_readiness(READABLE);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut consumed = 0;
        while let Some(n) = proto.decode(&pending[consumed..], &mut reply) {
            consumed += n;
            served.inc();
        }
        pending.drain(..consumed);

        if !reply.is_empty() {
            write_all(&src, &reply).await?;
            reply.clear();
        }

        if eof {
            break 'outer;
        }
    }
    Ok(())
}

async fn write_all(src: &IoSource<TcpStream>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match src.get_ref().write(data) {
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                src.clear_readiness(WRITABLE);
                src.writable().await;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Ping client: drives `count` request/response round trips against `peer` and returns how
/// many succeeded.
pub async fn client(shard: ShardHandle, peer: SocketAddr, count: usize) -> Result<usize> {
    let stream = TcpStream::connect(peer)?;
    let src = IoSource::new(shard.io(), stream)?;

    // Nonblocking connect: writable means the handshake finished, one way or the other.
    src.writable().await;
    if let Some(e) = src.get_ref().take_error()? {
        return Err(e.into());
    }

    let mut done = 0;
    let mut buf = [0u8; 64];
    for _ in 0..count {
        write_all(&src, b"PING\r\n").await?;

        let mut got = Vec::new();
        while !got.ends_with(b"\r\n") {
            src.readable().await;
            match src.get_ref().read(&mut buf) {
                Ok(0) => {
                    warn!("server closed mid-exchange");
                    return Ok(done);
                }
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    src.clear_readiness(READABLE);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if got == b"+PONG\r\n" {
            done += 1;
        } else {
            warn!(reply = %String::from_utf8_lossy(&got), "unexpected reply");
        }
    }
    Ok(done)
}

/// Run `pool` concurrent clients of `count` round trips each; returns total successes.
pub async fn client_pool(
    shard: ShardHandle,
    peer: SocketAddr,
    pool: usize,
    count: usize,
) -> Result<usize> {
    let mut handles = Vec::with_capacity(pool);
    for _ in 0..pool {
        handles.push(shard.spawn(client(shard.clone(), peer, count)));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await?;
    }
    Ok(total)
}
