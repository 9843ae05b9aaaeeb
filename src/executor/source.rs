use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use mio::event::Source;

use crate::sched::{SharedIoTable, READABLE, WRITABLE};

/// A registered event source plus its waiter slot. Registration happens on creation,
/// deregistration on drop, so readiness tracking lives exactly as long as the source.
///
/// Readiness is edge-triggered: after draining the descriptor to `WouldBlock` the caller must
/// [IoSource::clear_readiness] before awaiting again, or the next await returns immediately on
/// stale state.
pub struct IoSource<S: Source> {
    source: S,
    slot: usize,
    io: SharedIoTable,
}

impl<S: Source> IoSource<S> {
    pub fn new(io: SharedIoTable, mut source: S) -> io::Result<IoSource<S>> {
        let slot = io.borrow_mut().register(&mut source)?;
        Ok(IoSource { source, slot, io })
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Resolves when the source reports readable, including peer-close and error edges.
    pub fn readable(&self) -> Readable<'_, S> {
        Readable { source: self }
    }

    /// Resolves when the source reports writable.
    pub fn writable(&self) -> Writable<'_, S> {
        Writable { source: self }
    }

    pub fn clear_readiness(&self, bits: u8) {
        self.io.borrow_mut().clear_readiness(self.slot, bits);
    }

    fn poll_ready(&self, bits: u8, cx: &mut Context<'_>) -> Poll<()> {
        let mut io = self.io.borrow_mut();
        if io.readiness(self.slot) & bits != 0 {
            Poll::Ready(())
        } else {
            io.park(self.slot, bits, cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<S: Source> Drop for IoSource<S> {
    fn drop(&mut self) {
        self.io.borrow_mut().deregister(self.slot, &mut self.source);
    }
}

pub struct Readable<'a, S: Source> {
    source: &'a IoSource<S>,
}

impl<S: Source> Future for Readable<'_, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.source.poll_ready(READABLE, cx)
    }
}

pub struct Writable<'a, S: Source> {
    source: &'a IoSource<S>,
}

impl<S: Source> Future for Writable<'_, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.source.poll_ready(WRITABLE, cx)
    }
}
