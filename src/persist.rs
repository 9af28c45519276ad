//! Persist counter: outstanding parties that want the checkpoint machinery
//! kept alive. Pure bookkeeping; nothing here gates a checkpoint.

use crest_sys::AtomicWord;

use crate::error::{CrestError, Result};

#[derive(Debug, Default)]
pub struct PersistCounter(AtomicWord);

impl PersistCounter {
    pub const fn new() -> Self {
        Self(AtomicWord::new(0))
    }

    pub fn get(&self) -> usize {
        self.0.read() as usize
    }

    /// Returns the count before the increment.
    pub fn increment(&self) -> Result<usize> {
        loop {
            let cur = self.0.read();
            if cur == isize::MAX {
                return Err(CrestError::OutOfRange("persist counter overflow"));
            }
            if self.0.cmp_swap(cur, cur + 1) {
                return Ok(cur as usize);
            }
        }
    }

    /// Returns the count before the decrement. A zero counter stays zero.
    pub fn decrement(&self) -> Result<usize> {
        loop {
            let cur = self.0.read();
            if cur == 0 {
                return Err(CrestError::OutOfRange("persist counter underflow"));
            }
            if self.0.cmp_swap(cur, cur - 1) {
                return Ok(cur as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_underflow_leaves_zero() {
        let p = PersistCounter::new();
        assert!(matches!(p.decrement(), Err(CrestError::OutOfRange(_))));
        assert_eq!(p.get(), 0);
    }

    #[test]
    fn test_balanced_calls() {
        let p = PersistCounter::new();
        assert_eq!(p.increment().unwrap(), 0);
        assert_eq!(p.increment().unwrap(), 1);
        assert_eq!(p.decrement().unwrap(), 2);
        assert_eq!(p.get(), 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let p = Arc::new(PersistCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        p.increment().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.get(), 4000);
    }
}
