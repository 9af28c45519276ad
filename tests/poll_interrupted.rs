//! Polling through unrelated signal deliveries.
//!
//! Kept in its own test binary: it installs a process-wide handler.

mod common;

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crest::{ClientState, PollStatus, Scope};
use tempfile::NamedTempFile;

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_unrelated(_: libc::c_int) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// Handler without `SA_RESTART`, so blocking calls see `EINTR`.
fn install_unrelated(signum: libc::c_int) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_unrelated as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        assert_eq!(libc::sigaction(signum, &sa, ptr::null_mut()), 0);
    }
}

#[test]
fn test_poll_retries_after_unrelated_signals() {
    let signum = libc::SIGRTMIN() + 1;
    install_unrelated(signum);

    let (c, _) = common::local_client();
    let (tx, rx) = mpsc::channel::<libc::pthread_t>();

    // Hold the checkpoint off so that poll blocks; the other thread lets it
    // go once the signals have landed.
    let holder = c.clone();
    holder.enter_critical().unwrap();
    let worker = thread::spawn(move || {
        let poller = rx.recv().unwrap();
        common::wait_for_state(&holder, ClientState::Pending);
        thread::sleep(Duration::from_millis(50));
        for _ in 0..3 {
            assert_eq!(unsafe { libc::pthread_kill(poller, signum) }, 0);
            thread::sleep(Duration::from_millis(20));
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while INTERRUPTS.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "signals never arrived");
            thread::sleep(Duration::from_millis(5));
        }
        holder.leave_critical().unwrap()
    });

    let tmp = NamedTempFile::new().unwrap();
    let mut handle = c.request(Scope::Process, tmp.reopen().unwrap()).unwrap();
    tx.send(unsafe { libc::pthread_self() }).unwrap();

    assert_eq!(c.poll(&mut handle, None).unwrap(), PollStatus::Completed);
    assert!(INTERRUPTS.load(Ordering::SeqCst) >= 3);
    worker.join().unwrap();
    assert_eq!(c.status().unwrap(), ClientState::Idle);
}
