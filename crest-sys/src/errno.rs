//! errno wrapper

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const EINTR: i32 = libc::EINTR;
    pub const EAGAIN: i32 = libc::EAGAIN;
    pub const EBADF: i32 = libc::EBADF;
    pub const EINVAL: i32 = libc::EINVAL;

    /// errno of the calling thread.
    #[inline(always)]
    pub fn last() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// Map a libc-style return (negative on failure) to a result.
    #[inline(always)]
    pub fn result(ret: i64) -> Result<usize, Self> {
        if ret < 0 {
            Err(Self::last())
        } else {
            Ok(ret as usize)
        }
    }

    /// Put this value back into the calling thread's errno.
    #[inline(always)]
    pub fn restore(self) {
        unsafe { *libc::__errno_location() = self.0 };
    }

    pub fn is_interrupted(&self) -> bool {
        self.0 == Self::EINTR
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for std::io::Error {
    fn from(e: Errno) -> Self {
        std::io::Error::from_raw_os_error(e.0)
    }
}
