use io_uring::{
    types::{SubmitArgs, Timespec},
    IoUring,
};
use nix::libc;
use tracing::trace;

use crate::error::{Error, Result};

use super::{op::OpHandler, table::OpTable};

/// Completions are drained in bounded batches so a busy ring cannot starve submission of the
/// follow-up entries those completions stage.
const DISPATCH_BATCH: usize = 32;

/// The completion engine: an `io_uring` instance plus the operation table feeding it. One per
/// shard thread, driven by calling [Proactor::poll_and_dispatch] in a loop.
pub struct Proactor {
    ring: IoUring,
    table: OpTable,
    submit_timeout: Timespec,
}

impl Proactor {
    pub fn new(entries: u32) -> Result<Proactor> {
        let ring = IoUring::builder().build(entries)?;
        Ok(Proactor {
            ring,
            table: OpTable::new(),
            submit_timeout: Timespec::new().nsec(100_000_000),
        })
    }

    /// Register an operation and stage its first entries. Visible to the kernel after the
    /// next flush inside [Proactor::poll_and_dispatch].
    pub fn submit(&mut self, op: Box<dyn OpHandler>) -> Result<u64> {
        self.table.submit(op)
    }

    pub fn inflight(&self) -> usize {
        self.table.inflight()
    }

    /// Move staged entries into the submission ring, submitting to make room when it fills.
    /// `EBUSY` means the kernel cannot take more right now; entries stay staged for the next
    /// flush rather than being dropped.
    fn flush_staged(&mut self) -> Result<()> {
        let (submitter, mut sq, _) = self.ring.split();
        loop {
            if sq.is_full() {
                match submitter.submit() {
                    Ok(_) => (),
                    Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => break,
                    Err(err) => return Err(err.into()),
                }
            }
            sq.sync();

            match self.table.pop_staged() {
                Some(sqe) => unsafe {
                    if sq.push(&sqe).is_err() {
                        drop(sq);
                        self.table.push_front_staged(sqe);
                        break;
                    }
                },
                None => break,
            }
        }
        Ok(())
    }

    /// One engine iteration: flush staged work, wait for at least one completion bounded by
    /// the tick, then deliver completions in batches until the queue runs dry.
    pub fn poll_and_dispatch(&mut self) -> Result<()> {
        self.flush_staged()?;

        let args = SubmitArgs::new().timespec(&self.submit_timeout);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) => match e.raw_os_error() {
                // EBUSY: completion queue needs draining before more submissions.
                // ETIME: the tick elapsed without completions, which is a normal idle wait.
                Some(libc::EBUSY) | Some(libc::ETIME) => {}
                _ => return Err(Error::from(e)),
            },
        }

        loop {
            let mut batch = [(0u64, 0i32); DISPATCH_BATCH];
            let mut n = 0;
            {
                let mut cq = self.ring.completion();
                for cqe in &mut cq {
                    batch[n] = (cqe.user_data(), cqe.result());
                    n += 1;
                    if n == DISPATCH_BATCH {
                        break;
                    }
                }
            }
            if n == 0 {
                break;
            }
            trace!(completions = n, "dispatching batch");
            for &(user_data, res) in &batch[..n] {
                self.table.deliver(user_data, res)?;
            }
            if n < DISPATCH_BATCH {
                break;
            }
        }

        // Handlers staged their follow-up entries during delivery; get them in flight before
        // going back to sleep.
        self.flush_staged()
    }
}
