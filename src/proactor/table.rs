use std::collections::VecDeque;

use io_uring::squeue;
use slab::Slab;
use tracing::trace;

use crate::error::{Error, Result};

use super::op::{OpHandler, OpStatus, SqeSink, NULL_TOKEN};

/// Staged entries the submission ring could not absorb are bounded; past this the engine is
/// hopelessly behind and the only honest answer is a fatal error.
const STAGED_LIMIT: usize = 4096;

enum OpSlot {
    Active(Box<dyn OpHandler>),
    /// Handler temporarily checked out while its completion is delivered.
    Running,
}

/// Owns every in-flight operation and the staging queue feeding the submission ring. Kernel
/// user data values are slot index plus one, zero being [NULL_TOKEN]; delivery for null,
/// unknown, or already-released tokens is a no-op, which is what makes late completions from
/// cancelled chains safe.
pub struct OpTable {
    ops: Slab<OpSlot>,
    staged: VecDeque<squeue::Entry>,
}

impl OpTable {
    pub fn new() -> OpTable {
        OpTable {
            ops: Slab::with_capacity(1024),
            staged: VecDeque::with_capacity(1024),
        }
    }

    /// Register a handler, stage its first entries, and return its token.
    pub fn submit(&mut self, mut op: Box<dyn OpHandler>) -> Result<u64> {
        let token = (self.ops.vacant_key() + 1) as u64;
        let mut sink = SqeSink::new(token, &mut self.staged, STAGED_LIMIT);
        op.prepare(&mut sink);
        if sink.overflowed() {
            return Err(Error::RingOverflow);
        }
        self.ops.insert(OpSlot::Active(op));
        trace!(token, inflight = self.ops.len(), "operation registered");
        Ok(token)
    }

    /// Deliver one completion to its handler. Exactly-once: the first delivery under a token
    /// consumes it on release, later deliveries fall through silently.
    pub fn deliver(&mut self, user_data: u64, res: i32) -> Result<()> {
        if user_data == NULL_TOKEN {
            return Ok(());
        }
        let index = (user_data - 1) as usize;

        let Some(slot) = self.ops.get_mut(index) else {
            // Stale token, the operation already released.
            return Ok(());
        };
        let mut op = match std::mem::replace(slot, OpSlot::Running) {
            OpSlot::Active(op) => op,
            // Reentrant delivery for an op currently being completed.
            OpSlot::Running => return Ok(()),
        };

        match op.complete(res) {
            OpStatus::Release => {
                self.ops.remove(index);
                trace!(token = user_data, inflight = self.ops.len(), "operation released");
            }
            OpStatus::Rearm => {
                let mut sink = SqeSink::new(user_data, &mut self.staged, STAGED_LIMIT);
                op.prepare(&mut sink);
                let overflowed = sink.overflowed();
                self.ops[index] = OpSlot::Active(op);
                if overflowed {
                    return Err(Error::RingOverflow);
                }
            }
        }
        Ok(())
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn pop_staged(&mut self) -> Option<squeue::Entry> {
        self.staged.pop_front()
    }

    pub fn push_front_staged(&mut self, entry: squeue::Entry) {
        self.staged.push_front(entry);
    }

    pub fn inflight(&self) -> usize {
        self.ops.len()
    }
}

impl Default for OpTable {
    fn default() -> Self {
        OpTable::new()
    }
}
