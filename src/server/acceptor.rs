use std::{os::fd::RawFd, rc::Rc};

use io_uring::{opcode, types};
use nix::libc;
use tracing::{debug, warn};

use crate::{
    net,
    proactor::{OpHandler, OpStatus, SqeSink},
};

use super::ShardCtx;

/// Keeps a POLLIN armed on the listener and drains the accept queue on every edge. Accepted
/// sockets land in the admission queue; the engine loop turns them into connections after the
/// current dispatch batch, so a burst of accepts becomes visible on the next flush rather
/// than reentering the dispatcher.
pub struct AcceptOp {
    ctx: Rc<ShardCtx>,
    listener: RawFd,
}

impl AcceptOp {
    pub fn new(ctx: Rc<ShardCtx>, listener: RawFd) -> AcceptOp {
        AcceptOp { ctx, listener }
    }
}

impl OpHandler for AcceptOp {
    fn prepare(&mut self, sink: &mut SqeSink) {
        let poll = opcode::PollAdd::new(types::Fd(self.listener), libc::POLLIN as u32).build();
        sink.submit(poll);
    }

    fn complete(&mut self, res: i32) -> OpStatus {
        // Once shutdown starts the listener fd is closed out from under us; do not touch it.
        if self.ctx.is_shutdown() {
            debug!("listener poll retired for shutdown");
            return OpStatus::Release;
        }
        if res < 0 {
            warn!(res, "listener poll failed");
            return OpStatus::Release;
        }

        match net::accept_drain(self.listener, &mut self.ctx.pending.borrow_mut()) {
            Ok(()) => OpStatus::Rearm,
            Err(e) => {
                warn!(error = %e, "accept failed, retiring listener");
                OpStatus::Release
            }
        }
    }
}
