//! Completion-based engine backend over `io_uring`.
//!
//! Instead of waiting for readiness, operations are handed to the kernel and their results
//! delivered as completions. Each in-flight operation is owned by an [OpHandler] registered
//! in the [OpTable] under a nonzero token; linked entries that precede the tokened one carry
//! [NULL_TOKEN] and complete anonymously. The [Proactor] ties the table to the ring and
//! drives the flush/wait/dispatch cycle.

mod driver;
mod op;
mod table;

pub use driver::Proactor;
pub use op::{OpHandler, OpStatus, SqeSink, NULL_TOKEN};
pub use table::OpTable;
