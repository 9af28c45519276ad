//! Reserved checkpoint signal
//!
//! One real-time signal is reserved for checkpoint notifications. The
//! notifier queues it with a word-sized payload (the request token); the
//! handler reads the payload back out of the siginfo.

use std::mem::MaybeUninit;
use std::ptr;

use crate::errno::Errno;

/// si_code for signals sent with sigqueue(3).
pub const SI_QUEUE: i32 = -1;

pub type SigHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Default checkpoint signal: the highest real-time signal.
pub fn default_signal() -> i32 {
    libc::SIGRTMAX()
}

/// Whether `signum` is a real-time signal this process may reserve.
pub fn is_realtime(signum: i32) -> bool {
    signum >= libc::SIGRTMIN() && signum <= libc::SIGRTMAX()
}

/// Install `handler` for `signum` with SA_SIGINFO | SA_RESTART and every
/// other signal blocked while it runs.
///
/// Returns the address of the handler that was installed before.
pub fn install(signum: i32, handler: SigHandler) -> Result<usize, Errno> {
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        if libc::sigfillset(&mut sa.sa_mask) != 0 {
            return Err(Errno::last());
        }

        let mut old: libc::sigaction = MaybeUninit::zeroed().assume_init();
        if libc::sigaction(signum, &sa, &mut old) != 0 {
            return Err(Errno::last());
        }
        Ok(old.sa_sigaction)
    }
}

/// Address of the handler currently installed for `signum`.
pub fn current_handler(signum: i32) -> Result<usize, Errno> {
    unsafe {
        let mut old: libc::sigaction = MaybeUninit::zeroed().assume_init();
        if libc::sigaction(signum, ptr::null(), &mut old) != 0 {
            return Err(Errno::last());
        }
        Ok(old.sa_sigaction)
    }
}

/// Block every blockable signal on the calling thread.
///
/// Service threads use this so process-directed signals land elsewhere.
pub fn block_all() -> Result<(), Errno> {
    unsafe {
        let mut set: libc::sigset_t = MaybeUninit::zeroed().assume_init();
        libc::sigfillset(&mut set);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(Errno(rc));
        }
    }
    Ok(())
}

/// Queue `signum` to process `pid` carrying `value`.
pub fn queue(pid: libc::pid_t, signum: i32, value: usize) -> Result<(), Errno> {
    let sv = libc::sigval {
        sival_ptr: value as *mut libc::c_void,
    };
    let ret = unsafe { libc::sigqueue(pid, signum, sv) };
    if ret != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Send a plain signal to `pid`.
pub fn kill(pid: libc::pid_t, signum: i32) -> Result<(), Errno> {
    if unsafe { libc::kill(pid, signum) } != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Sender pid, si_code and payload of a delivered signal.
///
/// # Safety
/// `info` must point at the siginfo handed to an SA_SIGINFO handler.
#[inline(always)]
pub unsafe fn info_parts(info: *const libc::siginfo_t) -> (libc::pid_t, i32, usize) {
    let info = &*info;
    (info.si_pid(), info.si_code, info.si_value().sival_ptr as usize)
}

#[inline(always)]
pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

#[inline(always)]
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Best-effort write to stderr from any context.
pub fn write_stderr(msg: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

#[inline(always)]
pub fn yield_now() {
    unsafe {
        libc::sched_yield();
    }
}
