use core::result;
use std::io;

use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// An error representing a failure in the engine itself. Per-connection I/O failures never
/// surface here, they are handled by the connection state machine at the point of occurrence.
#[derive(Debug, Error)]
pub enum Error {
    #[error("encountered unexpected IO error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("submission ring and staging backlog are full")]
    RingOverflow,
}

impl From<nix::errno::Errno> for Error {
    fn from(value: nix::errno::Errno) -> Self {
        Self::Io(io::Error::from_raw_os_error(value as i32))
    }
}
