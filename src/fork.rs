//! Fork safety.
//!
//! Only the forking thread survives `fork()`. A child that inherited a
//! pending checkpoint, a running helper or an outstanding request would wait
//! on threads that no longer exist, so initialized clients are listed here
//! and reset by an atfork child handler.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Once};

use crest_sys::Errno;

use crate::client::Inner;

const MAX_TRACKED: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const UNTRACKED: AtomicPtr<Inner> = AtomicPtr::new(ptr::null_mut());

static TRACKED: [AtomicPtr<Inner>; MAX_TRACKED] = [UNTRACKED; MAX_TRACKED];
static REGISTER: Once = Once::new();

/// Runs in the child right after `fork()`, on the only thread there is.
unsafe extern "C" fn atfork_child() {
    for slot in TRACKED.iter() {
        let inner = slot.load(Ordering::Acquire);
        if !inner.is_null() {
            (*inner).after_fork();
        }
    }
}

/// Reset `inner` in future forked children.
pub(crate) fn track(inner: &Arc<Inner>) {
    REGISTER.call_once(|| {
        let rc = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
        if rc != 0 {
            log::warn!("Could not register fork handler: {}", Errno(rc));
        }
    });
    let raw = Arc::as_ptr(inner) as *mut Inner;
    for slot in TRACKED.iter() {
        if slot
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
    log::warn!("More than {} clients; forked children keep this one's state", MAX_TRACKED);
}

/// Stop tracking `inner`. Called as it is dropped.
pub(crate) fn forget(inner: *const Inner) {
    for slot in TRACKED.iter() {
        if slot
            .compare_exchange(inner as *mut Inner, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}
