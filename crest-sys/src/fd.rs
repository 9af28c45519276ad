//! Descriptor helpers for ordinary thread context

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::errno::Errno;

/// Whether `fd` is open for writing.
pub fn is_writable(fd: RawFd) -> Result<bool, Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Errno::last());
    }
    Ok(matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR))
}

/// Wait until `fd` is readable or `timeout` elapses (`None` waits forever).
///
/// Interruptions by unrelated signals are retried with the remaining time.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool, Errno> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let ms = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                left.as_millis().min(i32::MAX as u128) as i32
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            let e = Errno::last();
            if e.is_interrupted() {
                continue;
            }
            return Err(e);
        }
        if ret == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(Errno(libc::EBADF));
        }
        return Ok(true);
    }
}

/// One-shot completion doorbell.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> Result<(), Errno> {
        let one: u64 = 1;
        loop {
            let ret = unsafe {
                libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8)
            };
            if ret == 8 {
                return Ok(());
            }
            let e = Errno::last();
            if !e.is_interrupted() {
                return Err(e);
            }
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, Errno> {
        wait_readable(self.fd, timeout)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
