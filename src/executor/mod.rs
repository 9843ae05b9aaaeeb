//! Single-threaded shard executor over the readiness backend.
//!
//! A [Shard] pins one scheduler, one poller and one I/O table to the current thread and drives
//! them in a dispatch loop: run ready tasks up to a budget, absorb foreign wakes, then either
//! drain already-pending events with a zero timeout or block in the poller bounded by the
//! suspend timer. Wakers created here are `Send` (they only touch the injector queue and the
//! poller's wake handle), the tasks themselves never leave the thread.

mod source;

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use crossbeam_queue::SegQueue;
use futures::{
    future::LocalFutureObj,
    task::{waker, ArcWake},
    FutureExt,
};
use tracing::{debug, trace};

use crate::{
    error::Result,
    sched::{FiberScheduler, Poller, SharedIoTable, TaskScheduler},
    sync::OneShot,
    task::TaskId,
};

pub use source::{IoSource, Readable, Writable};

/// How many ready tasks run before the loop services I/O again.
const DISPATCH_BUDGET: usize = 64;

/// Upper bound on one blocking wait. Keeps the loop responsive to state only visible outside
/// the poller, like the shutdown flag.
const TICK: Duration = Duration::from_millis(100);

struct ShardInner {
    io: SharedIoTable,
    injector: Arc<SegQueue<TaskId>>,
    notifier: Arc<mio::Waker>,
    spawns: RefCell<Vec<LocalFutureObj<'static, ()>>>,
    shutdown: Arc<AtomicBool>,
    shutdown_watchers: RefCell<Vec<Waker>>,
}

/// Cheap per-thread handle used by tasks to spawn siblings, open I/O sources and observe
/// shutdown. Not `Send`; cross-thread control goes through [ShutdownHandle].
#[derive(Clone)]
pub struct ShardHandle {
    inner: Rc<ShardInner>,
}

impl ShardHandle {
    /// Spawn a task onto this shard. The future is admitted to the scheduler on the next
    /// dispatch iteration; the handle resolves to its output.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let shot = OneShot::new();
        let producer = shot.clone();
        let wrapped = async move {
            producer.complete(future.await);
        };
        self.inner
            .spawns
            .borrow_mut()
            .push(LocalFutureObj::new(Box::new(wrapped)));
        JoinHandle { shot }
    }

    pub(crate) fn io(&self) -> SharedIoTable {
        self.inner.io.clone()
    }

    /// Handle other threads can use to stop this shard.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.inner.shutdown.clone(),
            waker: self.inner.notifier.clone(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Resolves once shutdown has been requested. Used to break accept loops.
    pub fn shutdown_requested(&self) -> ShutdownRequested {
        ShutdownRequested {
            inner: self.inner.clone(),
        }
    }
}

/// Cross-thread shutdown control: sets the flag and kicks the shard out of its blocking wait.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Future side of [ShardHandle::shutdown_requested].
pub struct ShutdownRequested {
    inner: Rc<ShardInner>,
}

impl Future for ShutdownRequested {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            self.inner
                .shutdown_watchers
                .borrow_mut()
                .push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Handle to a spawned task's output.
pub struct JoinHandle<T> {
    shot: OneShot<T>,
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.shot.poll_unpin(cx)
    }
}

struct TaskWaker {
    id: TaskId,
    injector: Arc<SegQueue<TaskId>>,
    notifier: Arc<mio::Waker>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.injector.push(arc_self.id);
        // If the shard is awake this is redundant and harmless.
        let _ = arc_self.notifier.wake();
    }
}

/// One engine instance. Owns the scheduler and poller; consumed by [Shard::run].
pub struct Shard {
    scheduler: FiberScheduler,
    poller: Poller,
    inner: Rc<ShardInner>,
    shutdown_seen: bool,
}

impl Shard {
    pub fn new() -> Result<Shard> {
        let (poller, io) = Poller::new()?;
        let notifier = poller.wake_handle();
        let scheduler = FiberScheduler::new(notifier.clone());
        let inner = Rc::new(ShardInner {
            io,
            injector: scheduler.injector(),
            notifier,
            spawns: RefCell::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_watchers: RefCell::new(Vec::new()),
        });
        Ok(Shard {
            scheduler,
            poller,
            inner,
            shutdown_seen: false,
        })
    }

    pub fn handle(&self) -> ShardHandle {
        ShardHandle {
            inner: self.inner.clone(),
        }
    }

    /// Drive the shard until `root` completes. Tasks spawned by `root` that are still live
    /// when it finishes are dropped with the shard; graceful drains must be awaited inside
    /// `root` itself.
    pub fn run<F>(mut self, root: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let done = self.handle().spawn(root);
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        self.handle().spawn(async move {
            *sink.borrow_mut() = Some(done.await);
        });

        loop {
            self.admit_spawns();
            self.scheduler.absorb_wakes();
            self.observe_shutdown();

            for _ in 0..DISPATCH_BUDGET {
                let Some(id) = self.scheduler.pick_next() else {
                    break;
                };
                self.poll_task(id);
            }

            if let Some(output) = result.borrow_mut().take() {
                debug!("root task complete, shard exiting");
                return Ok(output);
            }

            let now = Instant::now();
            let timeout = if self.scheduler.has_ready() || !self.inner.spawns.borrow().is_empty()
            {
                Some(Duration::ZERO)
            } else {
                self.scheduler.suspend_until(now + TICK, now)
            };
            self.poller.wait(timeout, &self.inner.io)?;
            self.scheduler.expire_timer(Instant::now());
        }
    }

    fn admit_spawns(&mut self) {
        let mut spawns = self.inner.spawns.take();
        for future in spawns.drain(..) {
            self.scheduler.spawn(future);
        }
    }

    fn observe_shutdown(&mut self) {
        if self.shutdown_seen || !self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.shutdown_seen = true;
        debug!("shutdown requested");
        for waker in self.inner.shutdown_watchers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    fn poll_task(&mut self, id: TaskId) {
        let Some(mut future) = self.scheduler.checkout(id) else {
            return;
        };
        let waker = waker(Arc::new(TaskWaker {
            id,
            injector: self.inner.injector.clone(),
            notifier: self.inner.notifier.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(()) => self.scheduler.retire(id),
            Poll::Pending => self.scheduler.park(id, future),
        }
        trace!(id, live = self.scheduler.task_count(), "task polled");
    }
}

/// Yield to the scheduler once, letting other ready tasks run.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}
