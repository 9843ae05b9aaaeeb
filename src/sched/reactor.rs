use std::{cell::RefCell, io, rc::Rc, sync::Arc, task::Waker, time::Duration};

use mio::{event::Event, event::Source, Events, Interest, Poll, Registry, Token};
use slab::Slab;
use tracing::trace;

/// Readiness bit reported for reads (data available or peer closed its write side).
pub const READABLE: u8 = 0b01;
/// Readiness bit reported for writes.
pub const WRITABLE: u8 = 0b10;

/// Token 0 is reserved for the cross-thread wake handle; I/O slots start at 1.
const WAKE_TOKEN: Token = Token(0);

struct IoWaiter {
    readiness: u8,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// Table of registered descriptors and the task wakers parked on their readiness. Shared
/// between the poller (which feeds events in) and the I/O futures (which park wakers and
/// consume readiness). All access happens on the shard thread.
pub struct IoTable {
    registry: Registry,
    waiters: Slab<IoWaiter>,
}

pub type SharedIoTable = Rc<RefCell<IoTable>>;

impl IoTable {
    fn new(registry: Registry) -> IoTable {
        IoTable {
            registry,
            waiters: Slab::with_capacity(128),
        }
    }

    /// Register an event source for both directions and hand back its waiter slot.
    pub fn register<S: Source>(&mut self, source: &mut S) -> io::Result<usize> {
        let slot = self.waiters.insert(IoWaiter {
            readiness: 0,
            read_waker: None,
            write_waker: None,
        });
        let token = Token(slot + 1);
        if let Err(e) = self
            .registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)
        {
            self.waiters.remove(slot);
            return Err(e);
        }
        Ok(slot)
    }

    pub fn deregister<S: Source>(&mut self, slot: usize, source: &mut S) {
        if self.waiters.try_remove(slot).is_some() {
            // The source may already be gone (closed fd); nothing to do about it here.
            let _ = self.registry.deregister(source);
        }
    }

    /// Current readiness bits for a slot.
    pub fn readiness(&self, slot: usize) -> u8 {
        self.waiters.get(slot).map(|w| w.readiness).unwrap_or(0)
    }

    /// Drop readiness bits after the caller has drained the descriptor to `WouldBlock`.
    pub fn clear_readiness(&mut self, slot: usize, bits: u8) {
        if let Some(w) = self.waiters.get_mut(slot) {
            w.readiness &= !bits;
        }
    }

    /// Park a waker until the slot reports one of `bits`.
    pub fn park(&mut self, slot: usize, bits: u8, waker: Waker) {
        let Some(w) = self.waiters.get_mut(slot) else {
            return;
        };
        if bits & READABLE != 0 {
            w.read_waker = Some(waker.clone());
        }
        if bits & WRITABLE != 0 {
            w.write_waker = Some(waker);
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let Token(raw) = event.token();
        let Some(w) = self.waiters.get_mut(raw - 1) else {
            // Stale event for a slot torn down in the same batch; ignore it.
            return;
        };

        let mut bits = 0u8;
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            bits |= READABLE;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            bits |= WRITABLE;
        }
        w.readiness |= bits;

        if bits & READABLE != 0 {
            if let Some(waker) = w.read_waker.take() {
                waker.wake();
            }
        }
        if bits & WRITABLE != 0 {
            if let Some(waker) = w.write_waker.take() {
                waker.wake();
            }
        }
    }
}

/// The blocking half of the readiness backend: owns the OS poller and the cross-thread wake
/// handle. Only the shard's dispatch loop touches it.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<mio::Waker>,
}

impl Poller {
    /// Create the poller plus the shared I/O table wired to its registry. Failure here is
    /// fatal, there is no engine without a poller.
    pub fn new() -> io::Result<(Poller, SharedIoTable)> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let table = IoTable::new(poll.registry().try_clone()?);

        let poller = Poller {
            poll,
            events: Events::with_capacity(1024),
            waker,
        };
        Ok((poller, Rc::new(RefCell::new(table))))
    }

    /// Handle for forcing an immediate return from a blocking [Poller::wait], from any thread.
    pub fn wake_handle(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Block until at least one event arrives, the timeout elapses, or the wake handle fires;
    /// deliver readiness into the table. A `Some(Duration::ZERO)` timeout drains
    /// already-completed events without blocking.
    pub fn wait(&mut self, timeout: Option<Duration>, table: &SharedIoTable) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut delivered = 0;
        let mut table = table.borrow_mut();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            table.dispatch(event);
            delivered += 1;
        }
        trace!(delivered, "poller delivered readiness events");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn readiness_is_delivered_and_consumed() {
        let (mut poller, table) = Poller::new().expect("poller");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut server = mio::net::TcpStream::from_std(server);

        let slot = table.borrow_mut().register(&mut server).unwrap();

        client.write_all(b"x").unwrap();

        // Poll until the readable edge shows up.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while table.borrow().readiness(slot) & READABLE == 0 {
            assert!(std::time::Instant::now() < deadline, "no readiness event");
            poller.wait(Some(Duration::from_millis(50)), &table).unwrap();
        }

        table.borrow_mut().clear_readiness(slot, READABLE);
        assert_eq!(table.borrow().readiness(slot) & READABLE, 0);

        table.borrow_mut().deregister(slot, &mut server);
        assert_eq!(table.borrow().readiness(slot), 0);
    }

    #[test]
    fn wake_handle_unblocks_wait() {
        let (mut poller, table) = Poller::new().expect("poller");
        let waker = poller.wake_handle();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        // Without the wake this would sleep the full five seconds.
        let start = std::time::Instant::now();
        poller.wait(Some(Duration::from_secs(5)), &table).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        t.join().unwrap();
    }
}
