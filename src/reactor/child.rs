//! Child-process-exit watching.
//!
//! `SIGCHLD` is delivered through a self-pipe registered with the reactor
//! (via `signal-hook-mio`), so one poll step can wait on timers, I/O, and
//! process exits simultaneously without a dedicated thread. The signal
//! itself carries no payload beyond "something exited"; the actual status
//! is recovered with a `waitpid(-1, WNOHANG)` reaping loop, mirroring how a
//! libev child watcher's callback computes its exit code from `WEXITSTATUS`.

use std::collections::HashMap;

use mio::{Interest, Registry, Token};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::consts::SIGCHLD;
use signal_hook_mio::v0_8::Signals;

use crate::error::Error;
use crate::fiber::FiberId;
use crate::watcher::{WatcherKind, WatcherRecord};

pub struct ChildReaper {
    signals: Signals,
    waiting: HashMap<i32, WatcherRecord>,
}

impl ChildReaper {
    pub fn new(registry: &Registry, token: Token) -> Result<Self, Error> {
        let mut signals = Signals::new([SIGCHLD])?;
        registry.register(&mut signals, token, Interest::READABLE)?;
        Ok(Self {
            signals,
            waiting: HashMap::new(),
        })
    }

    pub fn watch(&mut self, pid: i32, fiber: FiberId) {
        self.waiting
            .insert(pid, WatcherRecord::new(WatcherKind::Child { pid }, fiber));
    }

    pub fn unwatch(&mut self, pid: i32) {
        self.waiting.remove(&pid);
    }

    /// Drains the signal self-pipe so the token doesn't keep firing.
    pub fn drain_signals(&mut self) {
        for _ in self.signals.pending() {}
    }

    /// Reaps every exited child currently waitable, returning
    /// `(pid, exit_status, fiber)` for the ones we're watching. Children
    /// this scheduler didn't register a watch for (forked elsewhere in the
    /// process) are reaped and silently dropped, since some exit status has
    /// to be consumed to keep `/proc` from accumulating zombies.
    pub fn reap(&mut self) -> Vec<(i32, i32, FiberId)> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if let Some(record) = self.waiting.remove(&pid.as_raw()) {
                        reaped.push((pid.as_raw(), code, record.fiber));
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    if let Some(record) = self.waiting.remove(&pid.as_raw()) {
                        reaped.push((pid.as_raw(), 128 + signal as i32, record.fiber));
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
                _ => continue,
            }
        }
        reaped
    }
}
