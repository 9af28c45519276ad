//! Critical-section gate.
//!
//! One word holds both the section depth and the idle bias:
//! `raw = depth * 2 + bias`. The bias bit is set while no checkpoint is
//! pending. The interrupt path clears it; whoever brings the word to zero
//! (the interrupt itself, or the last `leave`) owns the checkpoint. Zero
//! also means "checkpoint executing": new entries wait until the runner
//! resets the word.

use crest_sys::AtomicWord;

use crate::error::{CrestError, Result};

const BIAS: isize = 1;
const LEVEL: isize = 2;

#[derive(Debug)]
pub(crate) struct Gate {
    raw: AtomicWord,
}

impl Gate {
    pub(crate) const fn new() -> Self {
        Self {
            raw: AtomicWord::new(BIAS),
        }
    }

    /// Sections currently held.
    pub(crate) fn depth(&self) -> usize {
        (self.raw.read() / LEVEL) as usize
    }

    /// Take one level. Refused while a checkpoint executes and, for an
    /// outermost section, while one is pending.
    #[inline(always)]
    pub(crate) fn try_increment(&self, outermost: bool) -> bool {
        loop {
            let cur = self.raw.read();
            if cur == 0 || (outermost && cur & BIAS == 0) {
                return false;
            }
            if self.raw.cmp_swap(cur, cur + LEVEL) {
                return true;
            }
        }
    }

    /// Drop one level. `Ok(true)` hands the pending checkpoint to the caller.
    pub(crate) fn decrement(&self) -> Result<bool> {
        loop {
            let cur = self.raw.read();
            if cur < LEVEL {
                return Err(CrestError::OutOfRange("leave without matching enter"));
            }
            if self.raw.cmp_swap(cur, cur - LEVEL) {
                return Ok(cur - LEVEL == 0);
            }
        }
    }

    /// Remove the idle bias after an accepted interrupt. `true` if no
    /// section is held and the caller must run the checkpoint itself.
    pub(crate) fn drop_bias(&self) -> bool {
        loop {
            let cur = self.raw.read();
            if cur & BIAS == 0 {
                return false;
            }
            if self.raw.cmp_swap(cur, cur - BIAS) {
                return cur - BIAS == 0;
            }
        }
    }

    /// Restore the idle bias once a checkpoint has finished.
    #[inline(always)]
    pub(crate) fn reset(&self) {
        self.raw.write(BIAS);
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> isize {
        self.raw.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_depth() {
        let g = Gate::new();
        assert!(g.try_increment(true));
        assert!(g.try_increment(false));
        assert_eq!(g.depth(), 2);
        assert!(!g.decrement().unwrap());
        assert!(!g.decrement().unwrap());
        assert_eq!(g.depth(), 0);
        assert_eq!(g.raw(), BIAS);
    }

    #[test]
    fn test_leave_without_enter() {
        let g = Gate::new();
        assert!(matches!(g.decrement(), Err(CrestError::OutOfRange(_))));
        assert_eq!(g.raw(), BIAS);
    }

    #[test]
    fn test_last_leave_owns_pending_checkpoint() {
        let g = Gate::new();
        assert!(g.try_increment(true));
        assert!(!g.drop_bias());
        assert_eq!(g.depth(), 1);
        assert!(g.decrement().unwrap());
        // Executing: new entries are refused until reset.
        assert!(!g.try_increment(true));
        assert!(!g.try_increment(false));
        g.reset();
        assert!(g.try_increment(true));
    }

    #[test]
    fn test_pending_refuses_only_outermost_entries() {
        let g = Gate::new();
        assert!(g.try_increment(true));
        assert!(!g.drop_bias());
        assert!(!g.try_increment(true));
        assert!(g.try_increment(false));
        assert_eq!(g.depth(), 2);
        assert!(!g.decrement().unwrap());
        assert!(g.decrement().unwrap());
    }

    #[test]
    fn test_unbalanced_leave_cannot_take_the_bias() {
        let g = Gate::new();
        // Interrupt accepted but bias not yet dropped.
        assert!(matches!(g.decrement(), Err(CrestError::OutOfRange(_))));
        assert_eq!(g.raw(), BIAS);
        assert!(g.drop_bias());
        // A second drop is a no-op.
        assert!(!g.drop_bias());
        g.reset();
        assert_eq!(g.depth(), 0);
        assert!(g.try_increment(true));
    }

    #[test]
    fn test_interrupt_with_no_sections_runs_immediately() {
        let g = Gate::new();
        assert!(g.drop_bias());
    }
}
