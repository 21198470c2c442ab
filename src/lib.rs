#![allow(clippy::let_and_return)]
//! A cooperative fiber scheduler built on top of a single-threaded event
//! loop.
//!
//! Fibers are user-level coroutines that voluntarily suspend while waiting
//! on a timer, file-descriptor readiness, or a child process's exit, and are
//! resumed by the scheduler when that condition is met. Everything runs on
//! one OS thread except for [`scheduler::SchedulerHandle::unblock`] and
//! [`scheduler::SchedulerHandle::cancel`], the only entry points safe to
//! call from another thread.
//!
//! ```no_run
//! use std::time::Duration;
//! use fiber_scheduler::{fiber, scheduler, Scheduler};
//!
//! let sched = Scheduler::init().unwrap();
//! sched.spawn("greeter", || {
//!     scheduler::sleep(Duration::from_millis(10)).unwrap();
//!     println!("fiber {:?} woke up", fiber::current());
//! });
//! sched.run().unwrap();
//! ```
//!
//! # Modules
//! - [`reactor`]: the event loop adapter (timers, I/O readiness, child
//!   exit, cross-thread wakeup), wrapping [`mio`].
//! - [`run_queue`]: the double-buffered queue of fibers made runnable.
//! - [`watcher`]: the shared shape of a started watcher's record.
//! - [`fiber`]: the suspend/resume bridge, backed by [`corosensei`]
//!   stackful coroutines.
//! - [`scheduler`]: orchestrates the above into `init`/`close`/`run`/`poll`
//!   and the waiting primitives (`sleep`, `pause`, `block`, `io_wait`,
//!   `process_wait`).
//! - [`coio`]: convenience wrappers around standard I/O objects that wait
//!   through the active scheduler instead of blocking the OS thread.
//! - [`error`]: the crate's error type.
//! - [`nonblock`]: per-thread cache of descriptors already in non-blocking
//!   mode.
//!
//! # Non-goals
//! No work-stealing or multi-threaded scheduling, no preemption, no
//! protocol logic, and no buffered I/O: `io_wait` only reports readiness,
//! callers perform the actual read or write.

pub mod coio;
pub mod error;
pub mod fiber;
pub mod nonblock;
mod reactor;
mod run_queue;
pub mod scheduler;
pub mod watcher;

pub use error::{Error, Result};
pub use reactor::EventMask;
pub use scheduler::{Scheduler, SchedulerHandle};
