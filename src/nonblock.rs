//! Per-thread cache of file descriptors already known to be in non-blocking
//! mode, so that `io_wait` doesn't pay for an `fcntl` round-trip on every
//! call for a descriptor it has already seen.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;

thread_local! {
    static NONBLOCKING: RefCell<HashSet<RawFd>> = RefCell::new(HashSet::new());
}

/// Ensures `fd` is set to non-blocking mode. Cheap on repeat calls for the
/// same descriptor.
pub fn ensure_nonblocking(fd: RawFd) -> io::Result<()> {
    if NONBLOCKING.with(|cache| cache.borrow().contains(&fd)) {
        return Ok(());
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        return Err(io::Error::last_os_error());
    }

    NONBLOCKING.with(|cache| cache.borrow_mut().insert(fd));
    Ok(())
}

/// Forgets `fd`, e.g. once it has been closed and the number may be reused
/// by an unrelated descriptor that isn't necessarily non-blocking.
pub fn forget(fd: RawFd) {
    NONBLOCKING.with(|cache| {
        cache.borrow_mut().remove(&fd);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn caches_after_first_call() {
        let (r, _w) = nix::unistd::pipe().unwrap();
        let fd = r.as_raw_fd();
        ensure_nonblocking(fd).unwrap();
        assert!(NONBLOCKING.with(|c| c.borrow().contains(&fd)));
        // Second call must not re-stat the flags to do anything observable;
        // simply shouldn't error.
        ensure_nonblocking(fd).unwrap();
        forget(fd);
        assert!(!NONBLOCKING.with(|c| c.borrow().contains(&fd)));
    }
}
