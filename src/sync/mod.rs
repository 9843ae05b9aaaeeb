//! Shard-local synchronization primitives.

mod oneshot;

pub use oneshot::OneShot;
