//! Checkpoint execution.
//!
//! Runs on whichever thread owns the pending checkpoint: the interrupted
//! thread when no section was held, otherwise the thread that left the last
//! one. Everything here may execute inside a signal handler, so state lives
//! in plain atomic words and nothing allocates or locks.

use crest_sys::signal::gettid;
use crest_sys::{AtomicWord, Errno};

use crate::callback::{CallbackContext, CallbackEvent, Resume, Verdict};
use crate::client::{Client, Inner};
use crate::dumper::{CheckpointFlags, Token};
use crate::error::{AbortReason, CrestError, Result};
use crate::helper::Job;
use crate::hooks::HookEvent;
use crate::state::{ClientState, StateEvent};
use crate::transport::Delivery;

/// Terminal result of the checkpoint half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    Restart,
    Aborted(AbortReason),
    Failed(Errno),
}

const OUTCOME_NONE: isize = 0;
const OUTCOME_CONTINUE: isize = 1;
const OUTCOME_RESTART: isize = 2;
const OUTCOME_TEMP: isize = 3;
const OUTCOME_PERM: isize = 4;
const OUTCOME_OMIT: isize = 5;
const OUTCOME_FAILED: isize = 6;

/// Bookkeeping for the checkpoint in flight.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) token: AtomicWord,
    /// Thread id of the thread executing callbacks, 0 when none.
    pub(crate) runner: AtomicWord,
    /// Next callback index whose checkpoint half has not run.
    pub(crate) next: AtomicWord,
    /// Index of the running callback, -1 when none.
    pub(crate) current: AtomicWord,
    outcome: AtomicWord,
    errno: AtomicWord,
}

impl RunState {
    pub(crate) fn new() -> Self {
        let run = Self::default();
        run.current.write(-1);
        run
    }

    fn begin(&self, runner: isize) {
        self.runner.write(runner);
        self.next.write(0);
        self.current.write(-1);
        self.errno.write(0);
        self.outcome.write(OUTCOME_NONE);
    }

    pub(crate) fn after_fork(&self) {
        self.begin(0);
        self.token.write(0);
    }

    fn outcome(&self) -> Option<Outcome> {
        Some(match self.outcome.read() {
            OUTCOME_CONTINUE => Outcome::Continue,
            OUTCOME_RESTART => Outcome::Restart,
            OUTCOME_TEMP => Outcome::Aborted(AbortReason::TempFailure),
            OUTCOME_PERM => Outcome::Aborted(AbortReason::PermFailure),
            OUTCOME_OMIT => Outcome::Aborted(AbortReason::Omitted),
            OUTCOME_FAILED => Outcome::Failed(Errno(self.errno.read() as i32)),
            _ => return None,
        })
    }

    fn settle(&self, outcome: Outcome) {
        let word = match outcome {
            Outcome::Continue => OUTCOME_CONTINUE,
            Outcome::Restart => OUTCOME_RESTART,
            Outcome::Aborted(AbortReason::TempFailure) => OUTCOME_TEMP,
            Outcome::Aborted(AbortReason::PermFailure) => OUTCOME_PERM,
            Outcome::Aborted(AbortReason::Omitted) => OUTCOME_OMIT,
            Outcome::Failed(e) => {
                self.errno.write(e.0 as isize);
                OUTCOME_FAILED
            }
        };
        self.outcome.write(word);
    }
}

impl Inner {
    /// Accept a checkpoint notification.
    pub(crate) fn on_interrupt(&self, token: Token) -> Delivery {
        loop {
            match self.state.get() {
                ClientState::Idle => {
                    if self
                        .state
                        .apply_from(ClientState::Idle, StateEvent::Interrupt)
                        .is_some()
                    {
                        break;
                    }
                }
                ClientState::Pending | ClientState::Active => {
                    self.refuse(token, AbortReason::TempFailure);
                    return Delivery::Coalesced;
                }
                ClientState::Uninitialized | ClientState::Error => {
                    self.refuse(token, AbortReason::PermFailure);
                    return Delivery::Rejected;
                }
            }
        }
        self.run.token.write(token.as_usize() as isize);
        if self.gate.drop_bias() {
            Delivery::Ran(self.run_checkpoint())
        } else {
            Delivery::Deferred
        }
    }

    /// Tell the dumper this process will not take part in `token`.
    fn refuse(&self, token: Token, reason: AbortReason) {
        let channel = self.dumper.channel();
        channel.abort(token, reason);
        if channel.done(token).is_err() {
            self.fault("dumper rejected a refused checkpoint");
        }
    }

    /// Run the pending checkpoint to completion on the calling thread.
    pub(crate) fn run_checkpoint(&self) -> Resume {
        if self
            .state
            .apply_from(ClientState::Pending, StateEvent::Start)
            .is_none()
        {
            self.fault("checkpoint started outside the pending state");
            self.gate.reset();
            return Resume::Continue;
        }
        let token = self.current_token();
        self.run.begin(gettid() as isize);

        let resume = match self.drive(token, CheckpointFlags::Ready) {
            Outcome::Restart => Resume::Restart,
            _ => Resume::Continue,
        };

        // Resume halves go to exactly the callbacks whose checkpoint half ran.
        let invoked = (self.run.next.read().max(0) as usize).min(self.registry.len());
        for index in 0..invoked {
            self.invoke(index, CallbackEvent::Resume(resume));
        }
        self.run_hooks(resume);

        if self.dumper.channel().done(token).is_err() {
            self.fault("dumper rejected checkpoint completion");
        }
        self.run.runner.write(0);
        self.gate.reset();
        if self
            .state
            .apply_from(ClientState::Active, StateEvent::Finish)
            .is_none()
            && self.state.get() != ClientState::Error
        {
            self.fault("checkpoint finished outside the active state");
        }
        resume
    }

    /// Run any checkpoint halves not yet run, then capture.
    ///
    /// Re-entrant: a callback may call this through
    /// [`Client::checkpoint_now`], in which case the enclosing loop finds the
    /// outcome already settled.
    pub(crate) fn drive(&self, token: Token, flags: CheckpointFlags) -> Outcome {
        if let Some(done) = self.run.outcome() {
            return done;
        }
        let channel = self.dumper.channel();
        if let Some(reason) = flags.abort_reason() {
            channel.abort(token, reason);
            self.run.settle(Outcome::Aborted(reason));
            return Outcome::Aborted(reason);
        }
        loop {
            if let Some(done) = self.run.outcome() {
                return done;
            }
            let index = self.run.next.read() as usize;
            if index >= self.registry.len() {
                break;
            }
            self.run.next.write(index as isize + 1);
            if self.invoke(index, CallbackEvent::Checkpoint) == Verdict::Abort {
                if let Some(done) = self.run.outcome() {
                    return done;
                }
                let reason = AbortReason::PermFailure;
                channel.abort(token, reason);
                self.run.settle(Outcome::Aborted(reason));
                return Outcome::Aborted(reason);
            }
        }
        let outcome = match channel.capture(token, flags) {
            Ok(Resume::Continue) => Outcome::Continue,
            Ok(Resume::Restart) => Outcome::Restart,
            Err(e) => Outcome::Failed(e),
        };
        self.run.settle(outcome);
        outcome
    }

    fn invoke(&self, index: usize, event: CallbackEvent) -> Verdict {
        let context = match self.registry.get(index) {
            Some(entry) => entry.context,
            None => return Verdict::Proceed,
        };
        if context == CallbackContext::Thread && self.needs_handoff() {
            match self.helper.dispatch(Job::Callback(index, event)) {
                Ok(verdict) => verdict,
                Err(_) => {
                    self.fault("callback helper handoff failed");
                    Verdict::Abort
                }
            }
        } else {
            self.invoke_here(index, event)
        }
    }

    /// Whether thread-context work has to be handed to the helper. Runs it
    /// in place when already there, or when no helper runs (a forked child
    /// before its next registration or request).
    fn needs_handoff(&self) -> bool {
        !self.helper.is_current() && self.helper.is_running()
    }

    fn invoke_here(&self, index: usize, event: CallbackEvent) -> Verdict {
        let entry = match self.registry.get(index) {
            Some(e) => e,
            None => return Verdict::Proceed,
        };
        let prev = self.run.current.swap(index as isize);
        let verdict = entry.handler.handle(event, entry.arg);
        self.run.current.write(prev);
        verdict
    }

    /// Execute a job posted to the helper thread, as the runner.
    pub(crate) fn run_on_helper(&self, job: Job) -> Verdict {
        let prev = self.run.runner.swap(gettid() as isize);
        let verdict = match job {
            Job::Callback(index, event) => self.invoke_here(index, event),
            Job::Hook(event) => {
                self.hooks.run(event);
                Verdict::Proceed
            }
        };
        self.run.runner.write(prev);
        verdict
    }

    fn run_hooks(&self, resume: Resume) {
        if self.registry.len() == 0 {
            self.hooks.run(HookEvent::no_callbacks(resume));
            return;
        }
        if self.registry.has_context(CallbackContext::Thread) {
            let event = HookEvent::thread_context(resume);
            if !self.needs_handoff() {
                self.hooks.run(event);
            } else if self.helper.dispatch(Job::Hook(event)).is_err() {
                self.fault("callback helper handoff failed");
            }
        }
        if self.registry.has_context(CallbackContext::Signal) {
            self.hooks.run(HookEvent::signal_context(resume));
        }
    }
}

impl Client {
    /// From inside a callback: finish the checkpoint half now.
    ///
    /// Runs the checkpoint halves of every later callback, then either
    /// captures (`Ready`) or reports the given failure to the dumper.
    /// Returns how the capture resolved; a repeat call reports the same
    /// result.
    pub fn checkpoint_now(&self, flags: CheckpointFlags) -> Result<Resume> {
        let inner = &self.inner;
        let r = inner.usable().and_then(|_| {
            if !inner.in_callback() {
                return Err(CrestError::NotInCallback);
            }
            match inner.drive(inner.current_token(), flags) {
                Outcome::Continue => Ok(Resume::Continue),
                Outcome::Restart => Ok(Resume::Restart),
                Outcome::Aborted(reason) => Err(CrestError::Aborted(reason)),
                Outcome::Failed(e) => Err(CrestError::Io(e.into())),
            }
        });
        self.track(r)
    }
}
