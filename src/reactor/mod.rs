//! The event loop adapter: wraps a level-triggered multiplexer ([`mio`])
//! exposing one-shot timers, level-triggered I/O readiness, child-exit
//! notification, and a thread-safe async-wakeup watcher.
//!
//! This is the only component that talks to the kernel poller directly.
//! Everything above it (the scheduler core) deals exclusively in
//! [`FiberId`]s and [`Firing`]s.

pub mod child;
pub mod timer;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::Error;
use crate::fiber::FiberId;
use crate::watcher::{WatcherKind, WatcherRecord};

use child::ChildReaper;
use timer::{TimerHeap, TimerId};

bitflags::bitflags! {
    /// Which direction(s) of readiness a caller is waiting for. Mirrors the
    /// host's `IO::READABLE` / `IO::WRITABLE` bit constants.
    #[derive(Default)]
    pub struct EventMask: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

const WAKER_TOKEN: Token = Token(usize::MAX);
const CHILD_TOKEN: Token = Token(usize::MAX - 1);

/// An event the scheduler needs to act on, produced by one `run_once` step.
pub enum Firing {
    Io { fiber: FiberId, events: EventMask },
    Timer { fiber: FiberId },
    Child { fiber: FiberId, pid: i32, status: i32 },
}

pub struct Reactor {
    poll: Poll,
    timers: TimerHeap,
    io_watchers: HashMap<Token, WatcherRecord>,
    next_token: usize,
    child: ChildReaper,
    events: Events,
}

impl Reactor {
    /// Allocates a fresh reactor along with the [`Waker`] used to break a
    /// blocking poll from another thread. The waker is handed back
    /// separately (rather than kept only inside `Reactor`) because the
    /// scheduler's cross-thread handle needs its own clone-able reference
    /// to it that outlives any particular borrow of the reactor.
    pub fn new() -> Result<(Self, Arc<Waker>), Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let child = ChildReaper::new(poll.registry(), CHILD_TOKEN)?;
        let reactor = Self {
            poll,
            timers: TimerHeap::new(),
            io_watchers: HashMap::new(),
            next_token: 0,
            child,
            events: Events::with_capacity(128),
        };
        Ok((reactor, waker))
    }

    pub fn register_io(&mut self, fd: RawFd, mask: EventMask, fiber: FiberId) -> Result<Token, Error> {
        if fd < 0 {
            return Err(Error::InvalidFd);
        }
        if mask.is_empty() {
            return Err(Error::InvalidFd);
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = to_interest(mask);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;
        let record = WatcherRecord::new(WatcherKind::Io { fd, mask }, fiber);
        log::trace!("started watcher {} for {:?}", record.kind, record.fiber);
        self.io_watchers.insert(token, record);
        Ok(token)
    }

    pub fn deregister_io(&mut self, token: Token) -> Result<(), Error> {
        if let Some(record) = self.io_watchers.remove(&token) {
            if let WatcherKind::Io { fd, .. } = record.kind {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                log::trace!("stopped watcher {}", record.kind);
            }
        }
        Ok(())
    }

    pub fn start_timer(&mut self, after: Duration, fiber: FiberId) -> TimerId {
        log::trace!("started watcher {} for {:?}", WatcherKind::Timer, fiber);
        self.timers.insert(Instant::now() + after, fiber)
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    pub fn register_child(&mut self, pid: i32, fiber: FiberId) {
        log::trace!("started watcher {} for {:?}", WatcherKind::Child { pid }, fiber);
        self.child.watch(pid, fiber);
    }

    pub fn unregister_child(&mut self, pid: i32) {
        self.child.unwatch(pid);
    }

    /// Runs one step of the loop. If `block` is true and at least one timer
    /// is pending, blocks up to that timer's deadline; if `block` is true
    /// and none are, blocks indefinitely until an I/O, child, or wakeup
    /// event arrives. If `block` is false, services whatever is already
    /// ready without waiting.
    pub fn run_once(&mut self, block: bool) -> Result<Vec<Firing>, Error> {
        let timeout = if !block {
            Some(Duration::ZERO)
        } else {
            self.timers.next_timeout()
        };

        self.poll.poll(&mut self.events, timeout)?;

        let mut firings = Vec::new();
        let mut child_fired = false;
        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    // No-op by design: its only purpose is to make the
                    // blocking poll above return.
                }
                CHILD_TOKEN => child_fired = true,
                token => {
                    if let Some(record) = self.io_watchers.get(&token) {
                        if let WatcherKind::Io { mask: watched, .. } = record.kind {
                            let mut mask = EventMask::empty();
                            if event.is_readable() {
                                mask |= EventMask::READABLE;
                            }
                            if event.is_writable() {
                                mask |= EventMask::WRITABLE;
                            }
                            mask &= watched;
                            if !mask.is_empty() {
                                firings.push(Firing::Io {
                                    fiber: record.fiber,
                                    events: mask,
                                });
                            }
                        }
                    }
                }
            }
        }

        if child_fired {
            self.child.drain_signals();
        }
        for (pid, status, fiber) in self.child.reap() {
            firings.push(Firing::Child { fiber, pid, status });
        }

        // I/O firings are pushed ahead of timer firings so that when both
        // an I/O watcher and its companion timeout fire in the same round,
        // the scheduler's per-round dedup keeps the I/O outcome and drops
        // the timeout.
        for fiber in self.timers.expire(Instant::now()) {
            firings.push(Firing::Timer { fiber });
        }

        Ok(firings)
    }
}

fn to_interest(mask: EventMask) -> Interest {
    match (
        mask.contains(EventMask::READABLE),
        mask.contains(EventMask::WRITABLE),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("empty masks are rejected in register_io"),
    }
}
