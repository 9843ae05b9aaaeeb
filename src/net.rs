//! Nonblocking socket plumbing shared by both engine backends.

use std::{
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{
    sys::{
        eventfd::{EfdFlags, EventFd},
        socket::{
            accept4, bind, getsockname, listen, setsockopt, socket, sockopt, AddressFamily,
            Backlog, SockFlag, SockType, SockaddrStorage,
        },
    },
    unistd,
};
use tracing::warn;

use crate::error::Result;

const ACCEPT_BACKLOG: i32 = 128;

/// Create a nonblocking listener bound to `addr` and return it with the actual bound address,
/// which differs from the request when port 0 was asked for.
pub fn listener_socket(addr: SocketAddr) -> Result<(OwnedFd, SocketAddr)> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::new(ACCEPT_BACKLOG)?)?;

    let bound = local_addr(fd.as_raw_fd())?;
    Ok((fd, bound))
}

fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let storage = getsockname::<SockaddrStorage>(fd)?;
    if let Some(sin) = storage.as_sockaddr_in() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }
    if let Some(sin6) = storage.as_sockaddr_in6() {
        return Ok(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    Err(nix::errno::Errno::EAFNOSUPPORT.into())
}

/// Accept until the listener would block, collecting the new connections into `out`. Every
/// accepted socket is nonblocking. Transient per-connection failures are skipped, anything
/// else is the caller's problem.
pub fn accept_drain(listener: RawFd, out: &mut Vec<OwnedFd>) -> Result<()> {
    loop {
        match accept4(listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => out.push(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(nix::errno::Errno::EWOULDBLOCK) => return Ok(()),
            Err(nix::errno::Errno::ECONNABORTED) => {
                // Peer gave up while queued; nothing to clean up.
                warn!("connection aborted before accept");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Eventfd used to interrupt a blocked completion wait from another thread. The write side
/// is `Send + Sync`; the owning shard keeps a poll armed on the read side and drains it on
/// every wake.
pub struct WakeFd {
    inner: EventFd,
}

impl WakeFd {
    pub fn new() -> Result<WakeFd> {
        let inner = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )?;
        Ok(WakeFd { inner })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_fd().as_raw_fd()
    }

    /// Post one wake. Callable from any thread.
    pub fn wake(&self) -> Result<()> {
        self.inner.write(1)?;
        Ok(())
    }

    /// Consume pending wakes so the next poll arms cleanly.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = unistd::read(self.inner.as_fd().as_raw_fd(), &mut buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn listener_reports_bound_port() {
        let (fd, addr) = listener_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(addr.port(), 0);
        drop(fd);
    }

    #[test]
    fn accept_drain_collects_all_queued_connections() {
        let (fd, addr) = listener_socket("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut c = TcpStream::connect(addr).unwrap();
            c.write_all(b"x").unwrap();
            clients.push(c);
        }
        // Give the kernel a moment to finish the handshakes.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut accepted = Vec::new();
        accept_drain(fd.as_raw_fd(), &mut accepted).unwrap();
        assert_eq!(accepted.len(), 3);

        // A drained listener reports would-block, not an error.
        accept_drain(fd.as_raw_fd(), &mut accepted).unwrap();
        assert_eq!(accepted.len(), 3);
    }

    #[test]
    fn wakefd_roundtrip() {
        let wake = WakeFd::new().unwrap();
        wake.wake().unwrap();
        wake.wake().unwrap();
        wake.drain();
        // Drained; a second drain is a no-op on the nonblocking fd.
        wake.drain();
    }
}
