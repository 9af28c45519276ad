//! Futex-backed wait/wake on a shared word
//!
//! Waiting and waking are plain syscalls on an aligned integer, so both sides
//! may run inside a signal handler. Waits re-check the word after every wake
//! and swallow EINTR/EAGAIN/ETIMEDOUT.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::errno::Errno;

/// Upper bound on a single sleep. Waits re-arm after it elapses.
const WAIT_SLICE: libc::timespec = libc::timespec {
    tv_sec: 120,
    tv_nsec: 0,
};

#[derive(Debug, Default)]
#[repr(C)]
pub struct Futex {
    pub raw: AtomicI32,
}

impl Futex {
    pub const fn new(v: i32) -> Self {
        Self {
            raw: AtomicI32::new(v),
        }
    }

    pub fn get(&self) -> i32 {
        self.raw.load(Ordering::SeqCst)
    }

    pub fn set(&self, v: i32) {
        self.raw.store(v, Ordering::SeqCst);
    }

    pub fn cmp_set(&self, old: i32, new: i32) -> bool {
        self.raw
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_and_wake(&self, v: i32) {
        self.set(v);
        self.wake();
    }

    pub fn wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn sys_futex_wait(&self, expected: i32, timeout: &libc::timespec) -> Result<(), Errno> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAIT,
                expected,
                timeout as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            match Errno::last() {
                Errno(libc::ETIMEDOUT) | Errno(libc::EINTR) | Errno(libc::EAGAIN) => Ok(()),
                e => Err(e),
            }
        } else {
            Ok(())
        }
    }

    /// Block while the word equals `v`.
    pub fn wait_while_eq(&self, v: i32) -> Result<(), Errno> {
        while self.get() == v {
            self.sys_futex_wait(v, &WAIT_SLICE)?;
        }
        Ok(())
    }

    /// Block until the word equals `v`.
    pub fn wait_until(&self, v: i32) -> Result<(), Errno> {
        loop {
            let cur = self.get();
            if cur == v {
                return Ok(());
            }
            self.sys_futex_wait(cur, &WAIT_SLICE)?;
        }
    }

    /// Block while the word equals `v`, for at most `limit`.
    ///
    /// Returns `true` if the word changed before the deadline.
    pub fn wait_while_eq_for(&self, v: i32, limit: Duration) -> Result<bool, Errno> {
        let deadline = Instant::now() + limit;
        while self.get() == v {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let left = deadline - now;
            let ts = libc::timespec {
                tv_sec: left.as_secs() as libc::time_t,
                tv_nsec: left.subsec_nanos() as libc::c_long,
            };
            self.sys_futex_wait(v, &ts)?;
        }
        Ok(true)
    }
}
