//! Callback helper thread.
//!
//! Thread-context callbacks and hooks run here instead of on the interrupted
//! thread. The runner posts a job through plain atomics and a futex pair and
//! sleeps until the helper acknowledges it, so dispatch stays usable from a
//! signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crest_sys::signal::{block_all, gettid, yield_now};
use crest_sys::{AtomicWord, Errno, Futex};

use crate::callback::{CallbackEvent, Resume, Verdict};
use crate::client::Inner;
use crate::error::Result;
use crate::hooks::HookEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Callback(usize, CallbackEvent),
    Hook(HookEvent),
}

const JOB_CALLBACK: isize = 1;
const JOB_HOOK: isize = 2;

const STOPPED: isize = 0;
const STARTING: isize = 1;
const RUNNING: isize = 2;

fn encode_event(event: CallbackEvent) -> isize {
    match event {
        CallbackEvent::Checkpoint => 0,
        CallbackEvent::Resume(Resume::Continue) => 1,
        CallbackEvent::Resume(Resume::Restart) => 2,
    }
}

fn decode_event(raw: isize) -> CallbackEvent {
    match raw {
        0 => CallbackEvent::Checkpoint,
        1 => CallbackEvent::Resume(Resume::Continue),
        _ => CallbackEvent::Resume(Resume::Restart),
    }
}

#[derive(Default)]
struct Handoff {
    posted: Futex,
    finished: Futex,
    kind: AtomicWord,
    index: AtomicWord,
    event: AtomicWord,
    verdict: AtomicWord,
    tid: AtomicWord,
    shutdown: AtomicBool,
}

impl Handoff {
    fn load(&self) -> Option<Job> {
        match self.kind.read() {
            JOB_CALLBACK => Some(Job::Callback(
                self.index.read() as usize,
                decode_event(self.event.read()),
            )),
            JOB_HOOK => HookEvent::from_slot(self.event.read() as i32).map(Job::Hook),
            _ => None,
        }
    }
}

pub(crate) struct Helper {
    handoff: Arc<Handoff>,
    /// `STOPPED`, `STARTING` or `RUNNING`.
    thread: AtomicWord,
}

impl Helper {
    pub(crate) fn new() -> Self {
        Self {
            handoff: Arc::new(Handoff::default()),
            thread: AtomicWord::new(STOPPED),
        }
    }

    /// Start the helper thread if it is not running yet.
    pub(crate) fn ensure_started(&self, inner: Weak<Inner>) -> Result<()> {
        loop {
            match self.thread.read() {
                RUNNING => return Ok(()),
                STARTING => yield_now(),
                _ => {
                    if !self.thread.cmp_swap(STOPPED, STARTING) {
                        continue;
                    }
                    let handoff = self.handoff.clone();
                    let spawned = thread::Builder::new()
                        .name("crest-callbacks".to_string())
                        .spawn(move || helper_loop(handoff, inner));
                    if let Err(e) = spawned {
                        self.thread.write(STOPPED);
                        return Err(e.into());
                    }
                    self.thread.write(RUNNING);
                    log::debug!("Callback helper thread started");
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.read() == RUNNING
    }

    /// Forget the helper thread. Only for a freshly forked child, where it
    /// no longer exists.
    pub(crate) fn after_fork(&self) {
        let h = &self.handoff;
        h.posted.set(0);
        h.finished.set(0);
        h.kind.write(0);
        h.tid.write(0);
        h.shutdown.store(false, Ordering::SeqCst);
        self.thread.write(STOPPED);
    }

    /// True on the helper thread itself.
    pub(crate) fn is_current(&self) -> bool {
        self.handoff.tid.read() == gettid() as isize
    }

    /// Run `job` on the helper and wait for it. Async-signal-safe.
    pub(crate) fn dispatch(&self, job: Job) -> std::result::Result<Verdict, Errno> {
        let h = &self.handoff;
        match job {
            Job::Callback(index, event) => {
                h.kind.write(JOB_CALLBACK);
                h.index.write(index as isize);
                h.event.write(encode_event(event));
            }
            Job::Hook(event) => {
                h.kind.write(JOB_HOOK);
                h.event.write(event as isize);
            }
        }
        h.verdict.write(0);
        let seq = h.posted.get().wrapping_add(1);
        h.posted.set_and_wake(seq);
        h.finished.wait_until(seq)?;
        Ok(if h.verdict.read() == 1 {
            Verdict::Abort
        } else {
            Verdict::Proceed
        })
    }

    pub(crate) fn shutdown(&self) {
        let h = &self.handoff;
        h.shutdown.store(true, Ordering::SeqCst);
        h.posted.set_and_wake(h.posted.get().wrapping_add(1));
    }
}

fn helper_loop(handoff: Arc<Handoff>, inner: Weak<Inner>) {
    // A checkpoint interrupt landing here would wait on itself.
    if let Err(e) = block_all() {
        log::warn!("Callback helper could not block signals: {}", e);
    }
    handoff.tid.write(gettid() as isize);
    // Only dispatch moves `posted`, and nothing is dispatched before the
    // first thread-context entry exists.
    let mut seen = 0;
    loop {
        if handoff.posted.wait_while_eq(seen).is_err() {
            break;
        }
        seen = handoff.posted.get();
        if handoff.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let verdict = match (inner.upgrade(), handoff.load()) {
            (Some(inner), Some(job)) => inner.run_on_helper(job),
            _ => Verdict::Proceed,
        };
        handoff
            .verdict
            .write(if verdict == Verdict::Abort { 1 } else { 0 });
        handoff.finished.set_and_wake(seen);
    }
    handoff.tid.write(0);
    log::debug!("Callback helper thread exiting");
}
