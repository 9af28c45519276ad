//! Machine-word atomics
//!
//! The only shared-state primitive allowed on the interrupt path.

use core::sync::atomic::{AtomicIsize, Ordering};

#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicWord(AtomicIsize);

impl AtomicWord {
    pub const fn new(v: isize) -> Self {
        Self(AtomicIsize::new(v))
    }

    #[inline(always)]
    pub fn read(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn write(&self, v: isize) {
        self.0.store(v, Ordering::SeqCst);
    }

    /// Increment, returning the previous value.
    #[inline(always)]
    pub fn inc(&self) -> isize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrement and report whether the new value is zero.
    #[inline(always)]
    pub fn dec_and_test(&self) -> bool {
        self.0.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Store `new` iff the current value is `old`.
    #[inline(always)]
    pub fn cmp_swap(&self, old: isize, new: isize) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Swap in `new`, returning the previous value.
    #[inline(always)]
    pub fn swap(&self, new: isize) -> isize {
        self.0.swap(new, Ordering::SeqCst)
    }
}
