use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use futures::future::LocalFutureObj;
use slab::Slab;
use tracing::trace;

use crate::sched::{SuspendTimer, TaskScheduler};
use crate::task::{ReadyQueue, Task, TaskId, TaskState};

/// The shard's scheduler: owns the tasks, the FIFO ready queue, the foreign-wake injector and
/// the one-shot suspend timer. Everything except the injector and the notify handle is confined
/// to the shard thread.
pub struct FiberScheduler {
    tasks: Slab<Task>,
    ready: ReadyQueue,
    injector: Arc<SegQueue<TaskId>>,
    remote: Arc<mio::Waker>,
    timer: SuspendTimer,
}

impl FiberScheduler {
    pub fn new(remote: Arc<mio::Waker>) -> FiberScheduler {
        FiberScheduler {
            tasks: Slab::with_capacity(128),
            ready: ReadyQueue::new(),
            injector: Arc::new(SegQueue::new()),
            remote,
            timer: SuspendTimer::new(),
        }
    }

    /// Queue used by wakers to hand task ids back to the shard from any thread. Pushing alone
    /// does not unblock a sleeping shard; pair it with [TaskScheduler::notify].
    pub fn injector(&self) -> Arc<SegQueue<TaskId>> {
        self.injector.clone()
    }

    /// Admit a new task in the ready state.
    pub fn spawn(&mut self, future: LocalFutureObj<'static, ()>) -> TaskId {
        let id = self.tasks.insert(Task::new(future));
        self.ready.push(id);
        trace!(id, live = self.tasks.len(), "task spawned");
        id
    }

    /// Move every injected wake onto the ready queue. Ids referring to tasks that finished in
    /// the meantime, or that are already queued, are dropped here.
    pub fn absorb_wakes(&mut self) {
        while let Some(id) = self.injector.pop() {
            self.awaken(id);
        }
    }

    /// Take the future out of a running task so it can be polled without holding a borrow of
    /// the scheduler. The caller must follow up with [FiberScheduler::park] or
    /// [FiberScheduler::retire].
    pub fn checkout(&mut self, id: TaskId) -> Option<LocalFutureObj<'static, ()>> {
        let task = self.tasks.get_mut(id)?;
        debug_assert_eq!(task.state, TaskState::Running);
        Some(std::mem::replace(
            &mut task.future,
            LocalFutureObj::new(Box::new(async {})),
        ))
    }

    /// Return a pending future to its slot and suspend the task. A wake that raced with the
    /// poll sits in the injector and will re-ready the task on the next absorb.
    pub fn park(&mut self, id: TaskId, future: LocalFutureObj<'static, ()>) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.future = future;
            task.state = TaskState::Suspended;
        }
    }

    /// Drop a finished task.
    pub fn retire(&mut self, id: TaskId) {
        if self.tasks.try_remove(id).is_some() {
            trace!(id, live = self.tasks.len(), "task retired");
        }
    }

    /// Number of live tasks, whatever their state.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Disarm the suspend timer if its deadline has passed; true when it fired.
    pub fn expire_timer(&mut self, now: Instant) -> bool {
        self.timer.expire(now)
    }
}

impl TaskScheduler for FiberScheduler {
    fn awaken(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            // Slot freed or reused since the waker was created; spurious wakes are fine.
            return;
        };
        if task.state == TaskState::Suspended {
            task.state = TaskState::Ready;
            self.ready.push(id);
        }
    }

    fn pick_next(&mut self) -> Option<TaskId> {
        let id = self.ready.pop()?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.state = TaskState::Running;
        }
        Some(id)
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty() || !self.injector.is_empty()
    }

    fn suspend_until(&mut self, deadline: Instant, now: Instant) -> Option<Duration> {
        self.timer.arm(Some(deadline));
        self.timer.timeout(now)
    }

    fn notify(&self) {
        // Failure means the poll instance is gone, at which point nobody is sleeping.
        let _ = self.remote.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> FiberScheduler {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        // Keep the poll alive for the scheduler's lifetime in these tests.
        std::mem::forget(poll);
        FiberScheduler::new(waker)
    }

    fn noop_future() -> LocalFutureObj<'static, ()> {
        LocalFutureObj::new(Box::new(async {}))
    }

    #[test]
    fn awaken_is_exactly_once_until_run() {
        let mut sched = scheduler();
        let id = sched.spawn(noop_future());

        // Spawned tasks start ready; re-awakening must not double-queue.
        sched.awaken(id);
        sched.awaken(id);
        assert_eq!(sched.pick_next(), Some(id));
        assert_eq!(sched.pick_next(), None);

        // A running task ignores awaken too.
        sched.awaken(id);
        assert!(!sched.has_ready());

        // Once parked it becomes wakeable again, exactly once.
        let fut = sched.checkout(id).unwrap();
        sched.park(id, fut);
        sched.awaken(id);
        sched.awaken(id);
        assert_eq!(sched.pick_next(), Some(id));
        assert_eq!(sched.pick_next(), None);
    }

    #[test]
    fn pick_next_preserves_wake_order() {
        let mut sched = scheduler();
        let a = sched.spawn(noop_future());
        let b = sched.spawn(noop_future());
        let c = sched.spawn(noop_future());
        assert_eq!(sched.pick_next(), Some(a));
        assert_eq!(sched.pick_next(), Some(b));
        assert_eq!(sched.pick_next(), Some(c));
    }

    #[test]
    fn injected_wakes_count_as_ready() {
        let mut sched = scheduler();
        let id = sched.spawn(noop_future());
        assert_eq!(sched.pick_next(), Some(id));
        let fut = sched.checkout(id).unwrap();
        sched.park(id, fut);
        assert!(!sched.has_ready());

        sched.injector().push(id);
        assert!(sched.has_ready());
        sched.absorb_wakes();
        assert_eq!(sched.pick_next(), Some(id));
    }

    #[test]
    fn stale_injected_ids_are_dropped() {
        let mut sched = scheduler();
        let id = sched.spawn(noop_future());
        assert_eq!(sched.pick_next(), Some(id));
        sched.retire(id);

        sched.injector().push(id);
        sched.absorb_wakes();
        assert_eq!(sched.pick_next(), None);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn suspend_until_is_idempotent_per_deadline() {
        let mut sched = scheduler();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(100);

        let t1 = sched.suspend_until(deadline, now).unwrap();
        let t2 = sched.suspend_until(deadline, now).unwrap();
        assert!(t1 <= Duration::from_millis(100));
        assert_eq!(t1, t2);

        assert!(!sched.expire_timer(now));
        assert!(sched.expire_timer(deadline));
        assert!(!sched.expire_timer(deadline));
    }
}
