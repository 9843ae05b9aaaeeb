use std::{
    os::fd::{AsRawFd, OwnedFd},
    rc::Rc,
};

use io_uring::{opcode, types};
use nix::libc;
use nix::sys::socket::{shutdown, Shutdown};
use tracing::{debug, trace};

use crate::{
    proactor::{OpHandler, OpStatus, SqeSink},
    registry::ConnToken,
    stats::ServedCounter,
};

use super::{Protocol, ShardCtx};

const READ_BUF: usize = 4096;

/// Protocol position of one connection. `WaitReadable` and `Reading` collapse into a single
/// kernel round trip when link mode fuses the poll and the recv.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// A poll for POLLIN is in flight; no buffer is pinned.
    WaitReadable,
    /// A recv is in flight into the read buffer.
    Reading,
    /// A send of the pending reply bytes is in flight.
    Writing,
    /// Terminal. No further entries are staged for this connection.
    Closed,
}

/// What the connection wants after absorbing a completion.
pub enum NextIo {
    Continue,
    Close,
}

/// One client connection in the completion backend. The read buffer never reallocates while
/// the connection lives, the kernel holds a pointer into it whenever a recv is in flight.
/// The write buffer only grows inside the decode step, which runs strictly between the recv
/// completion and the send staging.
pub struct Connection {
    fd: OwnedFd,
    state: ConnState,
    proto: Protocol,
    linked: bool,
    rbuf: Vec<u8>,
    filled: usize,
    wbuf: Vec<u8>,
    wpos: usize,
}

impl Connection {
    pub fn new(fd: OwnedFd, proto: Protocol, linked: bool) -> Connection {
        Connection {
            fd,
            state: ConnState::WaitReadable,
            proto,
            linked,
            rbuf: vec![0u8; READ_BUF],
            filled: 0,
            wbuf: Vec::new(),
            wpos: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Stage the entries for the current state.
    pub fn prepare_io(&mut self, sink: &mut SqeSink) {
        let fd = types::Fd(self.fd.as_raw_fd());
        match self.state {
            ConnState::WaitReadable => {
                let poll = opcode::PollAdd::new(fd, libc::POLLIN as u32).build();
                if self.linked {
                    // Fused round trip: the poll completes anonymously and the recv fires
                    // right behind it. If the poll fails the recv comes back canceled.
                    sink.chain(poll);
                    self.stage_recv(sink);
                    self.state = ConnState::Reading;
                } else {
                    sink.submit(poll);
                }
            }
            ConnState::Reading => self.stage_recv(sink),
            ConnState::Writing => {
                let pending = &self.wbuf[self.wpos..];
                let send = opcode::Send::new(fd, pending.as_ptr(), pending.len() as u32).build();
                if self.linked {
                    // Fused reply: the send completes anonymously and the tokened poll
                    // reports the next readable. The send result is unobservable on this
                    // path, so the reply counts as fully written once the poll fires; a
                    // failed send cancels the poll and the error surfaces there.
                    sink.chain(send);
                    sink.submit(opcode::PollAdd::new(fd, libc::POLLIN as u32).build());
                    self.state = ConnState::WaitReadable;
                } else {
                    sink.submit(send);
                }
            }
            ConnState::Closed => {}
        }
    }

    fn stage_recv(&mut self, sink: &mut SqeSink) {
        let fd = types::Fd(self.fd.as_raw_fd());
        let spare = &mut self.rbuf[self.filled..];
        let recv = opcode::Recv::new(fd, spare.as_mut_ptr(), spare.len() as u32).build();
        sink.submit(recv);
    }

    /// Advance the state machine with the result of the in-flight entry. `res` follows kernel
    /// convention: bytes for recv/send, a poll mask for poll, negated errno on failure.
    pub fn on_complete(&mut self, res: i32, served: &ServedCounter) -> NextIo {
        match self.state {
            ConnState::WaitReadable => {
                if res < 0 {
                    debug!(fd = self.fd.as_raw_fd(), res, "poll failed, closing");
                    return self.close();
                }
                // On the fused write path the poll trails a chained send, so the kernel is
                // done with the write buffer by the time this fires.
                self.wbuf.clear();
                self.wpos = 0;
                self.state = ConnState::Reading;
                NextIo::Continue
            }
            ConnState::Reading => self.on_read(res, served),
            ConnState::Writing => self.on_write(res),
            ConnState::Closed => NextIo::Close,
        }
    }

    fn on_read(&mut self, res: i32, served: &ServedCounter) -> NextIo {
        if res == 0 {
            trace!(fd = self.fd.as_raw_fd(), "peer closed");
            return self.close();
        }
        if res < 0 {
            return match -res {
                libc::EAGAIN | libc::EINTR => NextIo::Continue,
                errno => {
                    debug!(fd = self.fd.as_raw_fd(), errno, "recv failed, closing");
                    self.close()
                }
            };
        }

        self.filled += res as usize;
        if self.filled > self.rbuf.len() {
            // The kernel wrote past the slice we handed it; nothing sane remains.
            return self.close();
        }

        let before = served.get();
        let mut consumed = 0;
        while let Some(n) = self
            .proto
            .decode(&self.rbuf[consumed..self.filled], &mut self.wbuf)
        {
            consumed += n;
            served.inc();
        }
        if consumed > 0 {
            self.rbuf.copy_within(consumed..self.filled, 0);
            self.filled -= consumed;
        }
        trace!(
            fd = self.fd.as_raw_fd(),
            requests = served.get() - before,
            pending = self.filled,
            "decoded"
        );

        if self.wbuf.is_empty() {
            if self.filled == self.rbuf.len() {
                // Buffer full with no decodable request: the peer is sending something we
                // will never be able to parse incrementally.
                return self.close();
            }
            self.state = ConnState::WaitReadable;
        } else {
            self.wpos = 0;
            self.state = ConnState::Writing;
        }
        NextIo::Continue
    }

    fn on_write(&mut self, res: i32) -> NextIo {
        if res < 0 {
            return match -res {
                libc::EAGAIN | libc::EINTR => NextIo::Continue,
                errno => {
                    debug!(fd = self.fd.as_raw_fd(), errno, "send failed, closing");
                    self.close()
                }
            };
        }

        self.wpos += res as usize;
        if self.wpos < self.wbuf.len() {
            // Short write: stay in Writing, the next staging sends the remainder.
            return NextIo::Continue;
        }

        self.wbuf.clear();
        self.wpos = 0;
        self.state = ConnState::WaitReadable;
        NextIo::Continue
    }

    fn close(&mut self) -> NextIo {
        // Both directions first, so the peer sees the teardown even if something still
        // pins the file when the descriptor is dropped.
        let _ = shutdown(self.fd.as_raw_fd(), Shutdown::Both);
        self.state = ConnState::Closed;
        NextIo::Close
    }
}

/// Ties a connection to the operation table. Every completion resolves the token against the
/// registry first, so a completion that outlived its connection, or races a recycled slot,
/// simply releases the op.
pub struct ConnOp {
    ctx: Rc<ShardCtx>,
    token: ConnToken,
}

impl ConnOp {
    pub fn new(ctx: Rc<ShardCtx>, token: ConnToken) -> ConnOp {
        ConnOp { ctx, token }
    }
}

impl OpHandler for ConnOp {
    fn prepare(&mut self, sink: &mut SqeSink) {
        if let Some(conn) = self.ctx.registry.borrow_mut().get_mut(self.token) {
            conn.prepare_io(sink);
        }
    }

    fn complete(&mut self, res: i32) -> OpStatus {
        let mut registry = self.ctx.registry.borrow_mut();
        let Some(conn) = registry.get_mut(self.token) else {
            return OpStatus::Release;
        };
        match conn.on_complete(res, &self.ctx.served) {
            NextIo::Continue => OpStatus::Rearm,
            NextIo::Close => {
                // Drop closes the fd; live is what drain shutdown watches.
                registry.remove(self.token);
                debug!(live = registry.len(), "connection closed");
                OpStatus::Release
            }
        }
    }
}
