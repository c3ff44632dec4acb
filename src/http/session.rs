//! Session operations abstraction
//!
//! HTTP message I/O is written against `SessionOps`, so the exchange code is
//! identical for client sessions taken from the pool and for sessions a
//! loopback server accepted.

use super::{Error, Result};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Session operations trait
pub trait SessionOps {
    /// Poll the session for readiness
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    /// Close the session; later operations fail with `Error::SessionClosed`
    fn close(&mut self) -> Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// `poll(2)` a single descriptor
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    loop {
        // SAFETY: pfd is a valid pollfd and nfds is 1
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// HTTP session wrapping a transport with a per-operation timeout
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read once the session is readable, or fail with `Error::Timeout`
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf)
    }

    /// Write all of `buf`, waiting for writability before each write
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if !self.session.poll(PollEvents::Write, self.timeout)? {
                return Err(Error::Timeout);
            }
            let n = self.session.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        self.session.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn get_ref(&self) -> &S {
        &self.session
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_inner(self) -> S {
        self.session
    }
}
