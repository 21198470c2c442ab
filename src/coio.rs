//! Cooperative I/O: thin wrappers around standard library I/O objects that
//! wait for readiness through whichever [`Scheduler`](crate::Scheduler) is
//! currently running on this thread, instead of blocking it.
//!
//! The scheduler core itself only ever signals readiness (`io_wait`); these
//! wrappers are the thing that actually performs a read or write and retries
//! on `WouldBlock`, since the core deliberately stays out of the
//! buffered-I/O business (see the crate's non-goals).

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::reactor::EventMask;
use crate::scheduler;

/// Wraps any [`AsRawFd`] type, routing readiness waits through the active
/// scheduler.
pub struct CoIo<T> {
    inner: T,
}

impl<T: AsRawFd> CoIo<T> {
    /// Wraps `inner`, putting its descriptor into non-blocking mode.
    pub fn new(inner: T) -> io::Result<Self> {
        crate::nonblock::ensure_nonblocking(inner.as_raw_fd())?;
        Ok(Self { inner })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn wait(&self, mask: EventMask, timeout: Option<Duration>) -> io::Result<()> {
        match scheduler::io_wait(self.inner.as_raw_fd(), mask, timeout) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(io::ErrorKind::TimedOut.into()),
            Err(e) => Err(to_io_error(e)),
        }
    }
}

impl<T: AsRawFd> AsRawFd for CoIo<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl<T: AsRawFd + Read> CoIo<T> {
    /// Reads into `buf`, waiting (up to `timeout`) for readability instead
    /// of blocking the thread when the descriptor isn't ready yet.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(EventMask::READABLE, timeout)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: AsRawFd + Write> CoIo<T> {
    /// Writes `buf`, waiting (up to `timeout`) for writability instead of
    /// blocking the thread when the descriptor isn't ready yet.
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(EventMask::WRITABLE, timeout)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: AsRawFd + Read> Read for CoIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl<T: AsRawFd + Write> Write for CoIo<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CoIo<TcpStream> {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }
}

/// Accepts connections through the active scheduler rather than blocking.
pub struct CoIoListener<L> {
    inner: L,
}

impl CoIoListener<TcpListener> {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        crate::nonblock::ensure_nonblocking(listener.as_raw_fd())?;
        Ok(Self { inner: listener })
    }

    /// Accepts the next incoming connection, waiting through the scheduler
    /// while none is available.
    pub fn accept(&self) -> Result<CoIo<TcpStream>, Error> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoIo::new(stream).map_err(Error::from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    scheduler::io_wait(self.inner.as_raw_fd(), EventMask::READABLE, None)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn inner(&self) -> &TcpListener {
        &self.inner
    }
}

impl CoIoListener<UnixListener> {
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        crate::nonblock::ensure_nonblocking(listener.as_raw_fd())?;
        Ok(Self { inner: listener })
    }

    pub fn accept(&self) -> Result<CoIo<UnixStream>, Error> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoIo::new(stream).map_err(Error::from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    scheduler::io_wait(self.inner.as_raw_fd(), EventMask::READABLE, None)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::Io(io_e) => io_e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn reads_once_the_peer_writes() {
        let scheduler = Scheduler::init().unwrap();
        let (a, b) = UnixStream::pair().unwrap();

        scheduler.spawn("reader", move || {
            let mut co = CoIo::new(a).unwrap();
            let mut buf = [0u8; 5];
            let n = co.read_with_timeout(&mut buf, Some(Duration::from_secs(1))).unwrap();
            assert_eq!(&buf[..n], b"hello");
        });
        scheduler.spawn("writer", move || {
            let mut b = b;
            b.write_all(b"hello").unwrap();
        });

        scheduler.run().unwrap();
    }
}
