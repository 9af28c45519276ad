//! Client state across `fork()`.
//!
//! Kept in its own test binary: the child is forked from the test process.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crest::{
    CallbackContext, CallbackEvent, Client, ClientState, Delivery, Resume, Token, Verdict,
};

/// Checks run in the child. The exit status names the first that failed.
fn child_checks(c: &Client, hits: &AtomicUsize) -> i32 {
    if !matches!(c.status(), Ok(ClientState::Idle)) {
        return 1;
    }
    if c.depth() != 0 {
        return 2;
    }
    // The helper thread stayed behind in the parent.
    if c.interrupt_line().deliver(Token::new(2)) != Delivery::Ran(Resume::Continue) {
        return 3;
    }
    if hits.load(Ordering::SeqCst) != 1 {
        return 4;
    }
    if c.enter_critical().is_err() || c.leave_critical().is_err() {
        return 5;
    }
    if !matches!(c.status(), Ok(ClientState::Idle)) {
        return 6;
    }
    0
}

#[test]
fn test_forked_child_starts_idle() {
    let (c, _) = common::recording_client();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    c.register_callback(
        move |event: CallbackEvent, _: usize| {
            if event == CallbackEvent::Checkpoint {
                h.fetch_add(1, Ordering::SeqCst);
            }
            Verdict::Proceed
        },
        0,
        CallbackContext::Thread,
    )
    .unwrap();

    c.enter_critical().unwrap();
    assert_eq!(c.interrupt_line().deliver(Token::new(1)), Delivery::Deferred);
    assert_eq!(c.status().unwrap(), ClientState::Pending);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        let code = child_checks(&c, &hits);
        unsafe { libc::_exit(code) };
    }

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);

    // The parent's pending checkpoint is untouched by the child.
    assert_eq!(c.status().unwrap(), ClientState::Pending);
    assert_eq!(c.leave_critical().unwrap(), Resume::Continue);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
