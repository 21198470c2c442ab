//! Error handling.
//!
//! Every synchronous failure mode of the scheduler (bad file descriptor, bad
//! pid, registering a watcher on a closed reactor, ...) is a variant of
//! [`Error`]. Cancellation delivered to a suspended fiber is also modeled as
//! an `Error`, carried inside [`crate::fiber::Wakeup::Cancelled`] and
//! re-raised by the waiting primitive that receives it.

use std::io;
use std::time::Duration;

/// A specialized [`Result`] type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases produced by the scheduler.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A wait primitive was given a file descriptor that cannot be
    /// registered with the reactor.
    #[error("invalid file descriptor")]
    InvalidFd,

    /// A negative or otherwise nonsensical duration was passed to a timed
    /// wait.
    #[error("invalid duration: {0:?}")]
    InvalidDuration(Duration),

    /// `process_wait` was called with a non-positive pid.
    #[error("invalid pid: {0}")]
    InvalidPid(i32),

    /// The wait was unwound by an injected cancellation rather than by the
    /// event it was waiting for.
    #[error("fiber operation cancelled: {0}")]
    Cancelled(String),

    /// A scheduler operation other than [`crate::scheduler::SchedulerHandle::unblock`]
    /// was invoked from a thread other than the one that created the
    /// [`crate::scheduler::Scheduler`].
    #[error("called from outside the scheduler's owning thread")]
    ForeignThread,

    /// A lower-level OS failure, e.g. registering a watcher with the
    /// reactor or setting a descriptor non-blocking.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A failure from a `nix` syscall wrapper (`waitpid`, signal
    /// registration, ...).
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

impl Error {
    /// Shorthand for constructing the cancellation variant.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }
}
