//! The fiber bridge: suspend/resume primitives for the stackful coroutines
//! the scheduler drives.
//!
//! There is no host runtime to borrow a coroutine type from, so fibers here
//! are backed directly by [`corosensei`] stackful coroutines. A fiber is
//! known to the rest of the crate only by its [`FiberId`]; the coroutine
//! object itself is owned exclusively by the scheduler's fiber table and is
//! looked up by id whenever it needs to be resumed.
//!
//! [`suspend`] is a free function, not a method on some handle threaded
//! through every call, because the source this crate is modeled on treats
//! yielding as implicit: arbitrary code running inside a fiber can suspend
//! it without the caller needing to plumb a context object down through
//! every intermediate call. That requires knowing, from anywhere on the
//! current thread's stack, which coroutine is currently running — tracked
//! here via a thread-local pointer to its [`Yielder`], re-armed each time
//! the fiber is resumed.

use std::cell::Cell;
use std::fmt;

use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::Error;
use crate::reactor::EventMask;

/// Opaque identifier for a fiber, stable for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn new(raw: u64) -> Self {
        FiberId(raw)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// The value a suspended fiber is resumed with.
///
/// The source this is modeled on suspends a host-language coroutine and
/// resumes it with either a value or an injected exception; Rust has no
/// exceptions, so the resume payload is this explicit tagged enum instead,
/// and every waiting primitive matches on it.
#[derive(Debug)]
pub enum Wakeup {
    /// A generic wakeup carrying no payload: `pause`, `unblock`, and a
    /// freshly spawned fiber's first resume all use this.
    Ready,
    /// The awaited file descriptor became ready for (a subset of) the
    /// requested events.
    Io(EventMask),
    /// The wait's companion timer expired before the event it was racing
    /// against.
    TimedOut,
    /// A watched child process exited; carries `(pid, exit_status)`.
    Process(i32, i32),
    /// The wait was cancelled out from under it; the waiting primitive
    /// re-raises this as an `Err`.
    Cancelled(Error),
}

pub(crate) type Body = Coroutine<Wakeup, (), ()>;

thread_local! {
    static CURRENT_YIELDER: Cell<*const Yielder<Wakeup, ()>> = Cell::new(std::ptr::null());
    static CURRENT_FIBER: Cell<Option<FiberId>> = Cell::new(None);
}

/// Returns the id of the fiber currently executing on this thread, or
/// `None` if called from the scheduler's own stack (outside any fiber).
pub fn current() -> Option<FiberId> {
    CURRENT_FIBER.with(Cell::get)
}

/// Suspends the currently running fiber, returning the [`Wakeup`] it is
/// resumed with.
///
/// # Panics
/// Panics if called from outside a fiber body.
pub fn suspend() -> Wakeup {
    let yielder_ptr = CURRENT_YIELDER.with(Cell::get);
    assert!(
        !yielder_ptr.is_null(),
        "fiber::suspend() called outside of a running fiber"
    );
    let fiber_id = CURRENT_FIBER.with(Cell::get);

    // SAFETY: `yielder_ptr` points at the `Yielder` corosensei handed to the
    // coroutine currently executing on this thread's stack. It was either
    // just set by `new_coroutine`'s entry closure or restored by the
    // previous `suspend()` call on this same coroutine; both happen on this
    // coroutine's own stack frame, which stays alive (pinned inside its
    // `Coroutine`, owned by the scheduler's fiber table) for as long as this
    // call can possibly be resumed into.
    let yielder = unsafe { &*yielder_ptr };
    let wakeup = yielder.suspend(());

    // We've been resumed. Some other fiber (or none) may have run on this
    // thread in the meantime and overwritten the thread-locals with its own
    // state; restore ours so a nested suspend() further down this call
    // stack still resolves to this coroutine.
    CURRENT_YIELDER.with(|c| c.set(yielder_ptr));
    CURRENT_FIBER.with(|c| c.set(fiber_id));
    wakeup
}

/// Builds a new, not-yet-started coroutine for `body`, tagged with `id`.
pub(crate) fn new_coroutine<F>(id: FiberId, body: F) -> Body
where
    F: FnOnce() + 'static,
{
    Coroutine::new(move |yielder, first: Wakeup| {
        CURRENT_YIELDER.with(|c| c.set(yielder as *const _));
        CURRENT_FIBER.with(|c| c.set(Some(id)));
        if let Wakeup::Cancelled(reason) = first {
            log::debug!("fiber {id:?} cancelled before it ever ran: {reason}");
            return;
        }
        body();
    })
}

/// Resumes `coroutine` with `wakeup`, running it until its next `suspend()`
/// or completion.
pub(crate) fn resume(coroutine: &mut Body, wakeup: Wakeup) -> CoroutineResult<(), ()> {
    coroutine.resume(wakeup)
}
