//! Cooperative scheduling for a single shard thread.
//!
//! The [TaskScheduler] contract splits responsibility between a dispatch loop and the
//! scheduling policy behind it: the loop asks `has_ready`/`pick_next` to decide whether
//! to run tasks or block in the poller, and `suspend_until` bounds how long that block
//! may last. `awaken` and `notify` are the two ways work re-enters the loop, from the
//! shard thread and from foreign threads respectively.

mod fiber;
mod reactor;
mod timer;

use std::time::{Duration, Instant};

use crate::task::TaskId;

pub use fiber::FiberScheduler;
pub use reactor::{IoTable, Poller, SharedIoTable, READABLE, WRITABLE};
pub use timer::SuspendTimer;

/// Scheduling contract driven by the shard dispatch loop.
pub trait TaskScheduler {
    /// Move a suspended task to the ready queue. Calling it for a task that is already
    /// ready, currently running, or gone is a no-op, so wakers may fire spuriously.
    fn awaken(&mut self, id: TaskId);

    /// Dequeue the next ready task and mark it running.
    fn pick_next(&mut self) -> Option<TaskId>;

    /// True when `pick_next` would yield a task, or foreign wakes are pending absorption.
    fn has_ready(&self) -> bool;

    /// Bound the next blocking wait by `deadline`. Re-arming with the same deadline is
    /// idempotent. Returns the remaining timeout, `None` when no deadline is armed.
    fn suspend_until(&mut self, deadline: Instant, now: Instant) -> Option<Duration>;

    /// Wake the shard out of a blocking wait. Safe to call from any thread.
    fn notify(&self);
}
