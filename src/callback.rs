//! Application-visible checkpoint callbacks.

use std::fmt;

/// How a checkpoint ended for the code that waited on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The snapshot was taken (or skipped) and this process keeps running.
    Continue,
    /// This process was rematerialized from the snapshot.
    Restart,
}

/// Which half of a checkpoint a callback is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    /// About to be captured.
    Checkpoint,
    /// Captured (or aborted) and now running again.
    Resume(Resume),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// Veto this checkpoint. Only honored for the checkpoint half.
    Abort,
}

/// Where a callback must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackContext {
    /// On the interrupted thread, inside the interrupt context.
    Signal,
    /// On the client's callback helper thread.
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) usize);

impl CallbackId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// A checkpoint/restart callback.
///
/// Called once with [`CallbackEvent::Checkpoint`] before capture and once
/// with [`CallbackEvent::Resume`] afterwards, in registration order both
/// times. `Signal` callbacks run in interrupt context and should restrict
/// themselves to async-signal-safe work.
pub trait Callback: Send + Sync {
    fn handle(&self, event: CallbackEvent, arg: usize) -> Verdict;
}

impl<F> Callback for F
where
    F: Fn(CallbackEvent, usize) -> Verdict + Send + Sync,
{
    fn handle(&self, event: CallbackEvent, arg: usize) -> Verdict {
        self(event, arg)
    }
}
