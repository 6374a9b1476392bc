//! Error handling utils.
//!
//! Kernel-facing failures keep the libc shape: a raw os error inside
//! [`std::io::Error`], reachable through [`std::io::Error::raw_os_error`].
//! I/O timeouts surface as `ETIMEDOUT` through the same channel. Event
//! demultiplexer registration failures carry the fd and the attempted
//! operation so the caller's log line is useful.
//!
//! Misuse of the runtime (arming an event twice, resuming a running fiber)
//! is a programmer error and panics instead of returning `Err`.

use std::io;
use std::os::unix::io::RawFd;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The event demultiplexer refused a registration change. No runtime
    /// state is committed when this is returned.
    #[error("epoll {op} for fd {fd} failed: {source}")]
    Registration {
        fd: RawFd,
        op: &'static str,
        source: io::Error,
    },

    /// A `getcontext`/`swapcontext` level failure while setting up or
    /// switching a fiber.
    #[error("context {op} failed: {source}")]
    Context {
        op: &'static str,
        source: io::Error,
    },
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};
