//! Generation-checked connection registry.
//!
//! Slots are reused aggressively, so a bare index is not a safe connection reference: a
//! completion or timer can fire after its connection died and its slot now holds a stranger.
//! Every lookup therefore carries the generation observed at insert time and resolves to
//! `None` once the slot has been recycled.

use std::task::{Context, Poll, Waker};

use slab::Slab;

/// Stable reference to a registered value: slab index plus the generation the slot had when
/// the value was inserted. `Copy` so it can be stashed in operation user data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnToken {
    index: usize,
    generation: u64,
}

impl ConnToken {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot<T> {
    generation: u64,
    value: T,
}

/// Registry of live connections with generational tokens and an awaitable empty condition
/// used by graceful drain.
pub struct Registry<T> {
    slots: Slab<Slot<T>>,
    generation: u64,
    empty_waker: Option<Waker>,
}

impl<T> Registry<T> {
    pub fn new() -> Registry<T> {
        Registry {
            slots: Slab::new(),
            generation: 0,
            empty_waker: None,
        }
    }

    pub fn insert(&mut self, value: T) -> ConnToken {
        self.generation += 1;
        let generation = self.generation;
        let index = self.slots.insert(Slot { generation, value });
        ConnToken { index, generation }
    }

    /// Resolve a token; stale tokens (slot freed or reused) yield `None`.
    pub fn get(&self, token: ConnToken) -> Option<&T> {
        self.slots
            .get(token.index)
            .filter(|slot| slot.generation == token.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, token: ConnToken) -> Option<&mut T> {
        self.slots
            .get_mut(token.index)
            .filter(|slot| slot.generation == token.generation)
            .map(|slot| &mut slot.value)
    }

    /// Remove the value behind a token. Stale tokens remove nothing. Wakes the drain waiter
    /// when the registry transitions to empty.
    pub fn remove(&mut self, token: ConnToken) -> Option<T> {
        match self.slots.get(token.index) {
            Some(slot) if slot.generation == token.generation => {}
            _ => return None,
        }
        let slot = self.slots.remove(token.index);
        if self.slots.is_empty() {
            if let Some(waker) = self.empty_waker.take() {
                waker.wake();
            }
        }
        Some(slot.value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Poll-style wait for the registry to become empty. The drain task parks here after the
    /// listener closes and is woken by the removal that frees the last slot.
    pub fn poll_empty(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.slots.is_empty() {
            Poll::Ready(())
        } else {
            self.empty_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn tokens_resolve_until_removed() {
        let mut reg = Registry::new();
        let a = reg.insert("a");
        let b = reg.insert("b");

        assert_eq!(reg.get(a), Some(&"a"));
        assert_eq!(reg.get(b), Some(&"b"));
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.remove(a), Some("a"));
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.remove(a), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stale_token_does_not_alias_reused_slot() {
        let mut reg = Registry::new();
        let old = reg.insert("old");
        reg.remove(old);

        // The slab reuses the freed slot for the next insert.
        let new = reg.insert("new");
        assert_eq!(new.index(), old.index());

        assert_eq!(reg.get(old), None);
        assert_eq!(reg.remove(old), None);
        assert_eq!(reg.get(new), Some(&"new"));
    }

    #[test]
    fn poll_empty_wakes_on_last_removal() {
        let mut reg = Registry::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(reg.poll_empty(&mut cx).is_ready());

        let a = reg.insert(1);
        let b = reg.insert(2);
        assert!(reg.poll_empty(&mut cx).is_pending());

        reg.remove(a);
        assert!(reg.poll_empty(&mut cx).is_pending());
        reg.remove(b);
        assert!(reg.poll_empty(&mut cx).is_ready());
    }
}
