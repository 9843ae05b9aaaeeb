use std::collections::VecDeque;

use futures::future::LocalFutureObj;

/// Identifies one task within its owning shard. Task ids are slab indices and are only
/// meaningful on the thread that spawned the task.
pub type TaskId = usize;

/// Lifecycle of a cooperative task. At most one task per shard is `Running` at any moment;
/// a `Ready` task is owned by the ready queue, a `Suspended` one by whatever primitive it is
/// blocked on (an I/O waiter slot, a oneshot cell).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Suspended,
    Terminated,
}

/// A cooperative task: a boxed local future plus its scheduling state. Tasks never move across
/// threads; they run until they return `Poll::Pending` at one of their suspension points.
pub struct Task {
    pub(crate) future: LocalFutureObj<'static, ()>,
    pub(crate) state: TaskState,
}

impl Task {
    pub(crate) fn new(future: LocalFutureObj<'static, ()>) -> Task {
        Task {
            future,
            state: TaskState::Ready,
        }
    }
}

/// FIFO queue of runnable tasks. Insertion order is wake order; the queue itself is dumb, the
/// at-most-once membership invariant is enforced by the scheduler via [TaskState]: only a
/// `Suspended` task may be enqueued, and enqueueing marks it `Ready`.
#[derive(Default)]
pub struct ReadyQueue {
    queue: VecDeque<TaskId>,
}

impl ReadyQueue {
    pub fn new() -> ReadyQueue {
        ReadyQueue {
            queue: VecDeque::with_capacity(128),
        }
    }

    pub fn push(&mut self, id: TaskId) {
        self.queue.push_back(id);
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_wake_order() {
        let mut rq = ReadyQueue::new();
        rq.push(3);
        rq.push(1);
        rq.push(2);
        assert_eq!(rq.len(), 3);
        assert_eq!(rq.pop(), Some(3));
        assert_eq!(rq.pop(), Some(1));
        assert_eq!(rq.pop(), Some(2));
        assert_eq!(rq.pop(), None);
        assert!(rq.is_empty());
    }
}
