//! Signal-safe primitives for crest
//!
//! Word-sized atomics, futex waits, the reserved checkpoint signal and a few
//! descriptor helpers. Everything in `atomic`, `futex` and `signal` may be
//! called from inside a signal handler; `fd` is for ordinary threads.

pub mod atomic;
pub mod errno;
pub mod fd;
pub mod futex;
pub mod signal;

pub use atomic::AtomicWord;
pub use errno::Errno;
pub use fd::EventFd;
pub use futex::Futex;
