use std::{cell::Cell, rc::Rc};

/// Shard-local counter of completed requests. Incremented once per decoded-and-answered request
/// by either backend; handles are cheap clones sharing one cell, all confined to the shard
/// thread.
#[derive(Clone, Default)]
pub struct ServedCounter(Rc<Cell<u64>>);

impl ServedCounter {
    pub fn new() -> ServedCounter {
        ServedCounter::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.set(self.0.get() + n);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}
