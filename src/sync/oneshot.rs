use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

#[derive(Debug)]
enum Cell<T> {
    Pending,
    Complete(T),
    Finalized,
}

impl<T> Cell<T> {
    fn complete(&mut self, val: T) {
        use Cell::*;
        match self {
            Finalized => panic!("invalid state can not call complete on finalized one shot."),
            Complete(..) => panic!("invalid state can not call complete more than once."),
            _ => *self = Complete(val),
        };
    }

    fn take(&mut self) -> Option<T> {
        use Cell::*;
        match std::mem::replace(self, Finalized) {
            Complete(val) => Some(val),
            Pending => {
                *self = Pending;
                None
            }
            Finalized => None,
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    cell: Cell<T>,
    waker: Option<Waker>,
}

/// Single-use completion cell shared between a producer and one awaiting consumer on the same
/// shard thread. Backs [crate::executor::JoinHandle]: the spawned task completes it with its
/// output, the handle awaits it.
#[derive(Debug)]
pub struct OneShot<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> OneShot<T> {
    pub fn new() -> OneShot<T> {
        OneShot {
            inner: Rc::new(RefCell::new(Inner {
                cell: Cell::Pending,
                waker: None,
            })),
        }
    }

    /// Store the value and wake the consumer if it is already parked.
    pub fn complete(&self, val: T) {
        let waker = {
            let mut inner = self.inner.borrow_mut();
            inner.cell.complete(val);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn take(&self) -> Option<T> {
        self.inner.borrow_mut().cell.take()
    }

    pub fn set_waker(&self, waker: Waker) {
        self.inner.borrow_mut().waker.replace(waker);
    }

    /// True once the value has been produced or consumed.
    pub fn is_complete(&self) -> bool {
        !matches!(self.inner.borrow().cell, Cell::Pending)
    }
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        OneShot::new()
    }
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        OneShot {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Future for OneShot<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.take() {
            Some(val) => Poll::Ready(val),
            None => {
                self.set_waker(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
