//! In-process dumper.
//!
//! Each request gets a slot and a worker thread. The worker interrupts the
//! client through its transport and then serves the capture handshake: the
//! interrupted thread moves the slot's phase word to `CAPTURE` and sleeps on
//! it, the worker writes the snapshot and moves it to `CAPTURED`. The client
//! side of the handshake only touches atomics and the futex.

use std::io::{self, BufWriter};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crest_sys::fd::wait_readable;
use crest_sys::signal::{self, getpid};
use crest_sys::{AtomicWord, Errno, EventFd, Futex};

use super::{
    CaptureChannel, CheckpointFlags, CheckpointInfo, CheckpointRequest, Completion,
    CompletionStatus, Dumper, Pid, RestartInfo, Scope, Token, CheckpointArgs,
};
use crate::callback::Resume;
use crate::error::{AbortReason, CrestError, Result};
use crate::image;
use crate::procfs;
use crate::transport::InterruptTransport;

const FREE: i32 = 0;
const SUBMITTED: i32 = 1;
const CAPTURE: i32 = 2;
const CAPTURED: i32 = 3;
const DONE: i32 = 4;
const COMPLETE: i32 = 5;

const KEEP: isize = 0;
const DISCARD: isize = 1;
const DISCARDED: isize = 2;

const RESULT_NONE: isize = 0;
const RESULT_CONTINUE: isize = 1;
const RESULT_RESTART: isize = 2;

fn encode_abort(reason: AbortReason) -> isize {
    match reason {
        AbortReason::TempFailure => 1,
        AbortReason::PermFailure => 2,
        AbortReason::Omitted => 3,
    }
}

fn decode_abort(word: isize) -> Option<AbortReason> {
    match word {
        1 => Some(AbortReason::TempFailure),
        2 => Some(AbortReason::PermFailure),
        3 => Some(AbortReason::Omitted),
        _ => None,
    }
}

struct Job {
    args: CheckpointArgs,
    dest: std::fs::File,
    dest_path: PathBuf,
    requester: Pid,
    target: Pid,
    events: EventFd,
    messages: Vec<String>,
    forwarded: Vec<(Scope, Pid)>,
    status: Option<CompletionStatus>,
}

impl Job {
    fn note(&mut self, msg: String) {
        log::debug!("{}", msg);
        self.messages.push(msg);
    }
}

#[derive(Default)]
struct Slot {
    /// Token of the request occupying the slot, 0 when free.
    token: AtomicWord,
    phase: Futex,
    aborted: AtomicWord,
    /// Capture result: `RESULT_*`, or a negated errno.
    result: AtomicWord,
    /// `DISCARD` once nobody will reap the request.
    discard: AtomicWord,
    job: Mutex<Option<Job>>,
}

impl Slot {
    fn job(&self) -> MutexGuard<'_, Option<Job>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Shared {
    slots: Box<[Slot]>,
    transport: Arc<dyn InterruptTransport>,
    next_token: AtomicUsize,
    rehearse_restart: AtomicBool,
}

impl Shared {
    /// Signal-safe lookup.
    fn slot(&self, token: Token) -> Option<&Slot> {
        let raw = token.as_usize() as isize;
        self.slots.iter().find(|s| raw != 0 && s.token.read() == raw)
    }

    fn known(&self, token: Token) -> Result<&Slot> {
        self.slot(token)
            .ok_or(CrestError::InvalidArgument("unknown checkpoint token"))
    }

    fn claim(&self, token: Token) -> Option<usize> {
        let raw = token.as_usize() as isize;
        self.slots.iter().position(|s| s.token.cmp_swap(0, raw))
    }

    fn release(&self, slot: &Slot) {
        slot.job().take();
        slot.discard.write(KEEP);
        slot.phase.set(FREE);
        slot.token.write(0);
    }

    /// Take the snapshot for the job in `slot`.
    fn write_image(&self, slot: &Slot) -> isize {
        let mut guard = slot.job();
        let job = match guard.as_mut() {
            Some(j) => j,
            None => return -(Errno::EINVAL as isize),
        };
        let written = image::capture_snapshot(job.requester, job.target, &job.args, &job.forwarded)
            .and_then(|snap| image::write_snapshot(&mut BufWriter::new(&job.dest), &snap));
        match written {
            Ok(n) => {
                let msg = format!(
                    "wrote {} byte {} snapshot of pid {} to {}",
                    n,
                    job.args.scope,
                    job.target,
                    job.dest_path.display()
                );
                job.note(msg);
                if self.rehearse_restart.swap(false, Ordering::SeqCst) {
                    job.note("resuming as a restart".to_string());
                    RESULT_RESTART
                } else {
                    RESULT_CONTINUE
                }
            }
            Err(e) => {
                let errno = match &e {
                    CrestError::Io(io) => io.raw_os_error().unwrap_or(libc::EIO),
                    _ => libc::EIO,
                };
                job.note(format!("capture failed: {}", e));
                -(errno as isize)
            }
        }
    }

    fn finish(&self, slot: &Slot, token: Token, failure: Option<io::Error>) {
        self.complete(slot, token, failure);
        if slot.discard.cmp_swap(DISCARD, DISCARDED) {
            log::debug!("Checkpoint request {} was dropped unpolled", token);
            self.release(slot);
        }
    }

    fn complete(&self, slot: &Slot, token: Token, failure: Option<io::Error>) {
        let mut guard = slot.job();
        if let Some(job) = guard.as_mut() {
            let status = match failure {
                Some(e) => CompletionStatus::Failed(e),
                None => match (decode_abort(slot.aborted.read()), slot.result.read()) {
                    (Some(reason), _) => CompletionStatus::Aborted(reason),
                    (None, RESULT_CONTINUE) => CompletionStatus::Completed,
                    (None, RESULT_RESTART) => CompletionStatus::Restarted,
                    (None, RESULT_NONE) => CompletionStatus::Failed(io::Error::new(
                        io::ErrorKind::Other,
                        "checkpoint finished without a capture",
                    )),
                    (None, e) => CompletionStatus::Failed(io::Error::from_raw_os_error(-e as i32)),
                },
            };
            if let (CompletionStatus::Completed, Some(sig)) = (&status, job.args.signal) {
                match signal::kill(job.target, sig) {
                    Ok(()) => job.note(format!("sent signal {} to pid {}", sig, job.target)),
                    Err(e) => job.note(format!("signal {} to pid {} failed: {}", sig, job.target, e)),
                }
            }
            log::info!("Checkpoint request {} finished: {:?}", token, status);
            job.status = Some(status);
            slot.phase.set_and_wake(COMPLETE);
            if let Err(e) = job.events.notify() {
                log::warn!("Failed to signal completion of {}: {}", token, e);
            }
        }
    }

    fn serve(&self, index: usize, token: Token) {
        let slot = &self.slots[index];
        // The interrupt must land on a thread that is not serving it.
        if let Err(e) = signal::block_all() {
            log::warn!("Dump worker for {} could not block signals: {}", token, e);
        }
        if let Err(e) = self.transport.raise(token) {
            log::warn!("Could not interrupt client for {}: {}", token, e);
            self.finish(slot, token, Some(io::Error::new(io::ErrorKind::Other, e.to_string())));
            return;
        }
        loop {
            match slot.phase.get() {
                CAPTURE => {
                    let r = self.write_image(slot);
                    slot.result.write(r);
                    slot.phase.set_and_wake(CAPTURED);
                }
                DONE => break,
                phase => {
                    if let Err(e) = slot.phase.wait_while_eq(phase) {
                        self.finish(slot, token, Some(e.into()));
                        return;
                    }
                }
            }
        }
        self.finish(slot, token, None);
    }
}

impl CaptureChannel for Shared {
    fn capture(&self, token: Token, _flags: CheckpointFlags) -> std::result::Result<Resume, Errno> {
        let slot = self.slot(token).ok_or(Errno(Errno::EINVAL))?;
        if !slot.phase.cmp_set(SUBMITTED, CAPTURE) {
            return Err(Errno(Errno::EINVAL));
        }
        slot.phase.wake();
        slot.phase.wait_while_eq(CAPTURE)?;
        match slot.result.read() {
            RESULT_CONTINUE => Ok(Resume::Continue),
            RESULT_RESTART => Ok(Resume::Restart),
            e if e < 0 => Err(Errno(-e as i32)),
            _ => Err(Errno(libc::EIO)),
        }
    }

    fn abort(&self, token: Token, reason: AbortReason) {
        if let Some(slot) = self.slot(token) {
            slot.aborted.write(encode_abort(reason));
        }
    }

    fn done(&self, token: Token) -> std::result::Result<(), Errno> {
        let slot = self.slot(token).ok_or(Errno(Errno::EINVAL))?;
        if slot.phase.cmp_set(SUBMITTED, DONE) || slot.phase.cmp_set(CAPTURED, DONE) {
            slot.phase.wake();
            Ok(())
        } else {
            Err(Errno(Errno::EINVAL))
        }
    }
}

/// Dumper that snapshots the calling process from a worker thread.
pub struct LocalDumper {
    shared: Arc<Shared>,
}

impl LocalDumper {
    pub fn new(transport: Arc<dyn InterruptTransport>, slots: usize) -> Self {
        let slots = (0..slots.max(1))
            .map(|_| Slot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shared: Arc::new(Shared {
                slots,
                transport,
                next_token: AtomicUsize::new(1),
                rehearse_restart: AtomicBool::new(false),
            }),
        }
    }

    /// Make the next capture resume as a restart.
    pub fn rehearse_restart(&self) {
        self.shared.rehearse_restart.store(true, Ordering::SeqCst);
    }
}

impl Dumper for LocalDumper {
    fn channel(&self) -> &dyn CaptureChannel {
        &*self.shared
    }

    fn submit(&self, request: CheckpointRequest) -> Result<Token> {
        let me = getpid();
        let target = match request.args.target {
            None => me,
            Some(pid) if pid == me => me,
            Some(_) => {
                return Err(CrestError::InvalidArgument(
                    "in-process dumper can only capture its own process",
                ))
            }
        };
        if let Some(sig) = request.args.signal {
            if sig <= 0 || sig > libc::SIGRTMAX() {
                return Err(CrestError::InvalidArgument("invalid completion signal"));
            }
        }
        let dest_path = procfs::fd_path(request.dest.as_raw_fd()).unwrap_or_default();
        let events = EventFd::new().map_err(io::Error::from)?;

        let token = Token::new(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let index = self
            .shared
            .claim(token)
            .ok_or(CrestError::NoSpace(self.shared.slots.len()))?;
        let slot = &self.shared.slots[index];
        slot.aborted.write(0);
        slot.result.write(RESULT_NONE);
        slot.discard.write(KEEP);
        *slot.job() = Some(Job {
            args: request.args,
            dest: request.dest,
            dest_path,
            requester: me,
            target,
            events,
            messages: Vec::new(),
            forwarded: Vec::new(),
            status: None,
        });
        slot.phase.set(SUBMITTED);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("crest-dump-{}", token.as_usize()))
            .spawn(move || shared.serve(index, token));
        if let Err(e) = spawned {
            self.shared.release(slot);
            return Err(e.into());
        }
        log::info!(
            "Checkpoint request {} submitted: {} scope, pid {}",
            token,
            request.args.scope,
            target
        );
        Ok(token)
    }

    fn wait(&self, token: Token, timeout: Option<Duration>) -> Result<bool> {
        let slot = self.shared.known(token)?;
        if slot.phase.get() == COMPLETE {
            return Ok(true);
        }
        let fd = match slot.job().as_ref() {
            Some(job) => job.events.fd(),
            None => return Err(CrestError::InvalidArgument("request already reaped")),
        };
        wait_readable(fd, timeout).map_err(|e| CrestError::PollFailed(e.into()))
    }

    fn reap(&self, token: Token) -> Result<Completion> {
        let slot = self.shared.known(token)?;
        if slot.phase.get() != COMPLETE {
            return Err(CrestError::InvalidArgument("request still in progress"));
        }
        let job = slot
            .job()
            .take()
            .ok_or(CrestError::InvalidArgument("request already reaped"))?;
        self.shared.release(slot);
        Ok(Completion {
            status: job.status.unwrap_or_else(|| {
                CompletionStatus::Failed(io::Error::new(io::ErrorKind::Other, "no status recorded"))
            }),
            messages: job.messages,
        })
    }

    fn discard(&self, token: Token) {
        let slot = match self.shared.slot(token) {
            Some(s) => s,
            None => return,
        };
        slot.discard.write(DISCARD);
        // Whichever of us and the worker sees both flags frees the slot.
        if slot.phase.get() == COMPLETE && slot.discard.cmp_swap(DISCARD, DISCARDED) {
            self.shared.release(slot);
        }
    }

    fn checkpoint_info(&self, token: Token) -> Result<CheckpointInfo> {
        let slot = self.shared.known(token)?;
        let guard = slot.job();
        let job = guard
            .as_ref()
            .ok_or(CrestError::InvalidArgument("request already reaped"))?;
        Ok(CheckpointInfo {
            requester: job.requester,
            target: job.target,
            scope: job.args.scope,
            signal: job.args.signal,
            dest: job.dest_path.clone(),
        })
    }

    fn restart_info(&self, token: Token) -> Result<RestartInfo> {
        let slot = self.shared.known(token)?;
        let guard = slot.job();
        let job = guard
            .as_ref()
            .ok_or(CrestError::InvalidArgument("request already reaped"))?;
        Ok(RestartInfo {
            requester: job.requester,
            src: job.dest_path.clone(),
        })
    }

    fn forward(&self, token: Token, scope: Scope, target: Pid) -> Result<()> {
        let slot = self.shared.known(token)?;
        let mut guard = slot.job();
        let job = guard
            .as_mut()
            .ok_or(CrestError::InvalidArgument("request already reaped"))?;
        if !procfs::process_tree(job.target)?.contains(&target) {
            return Err(CrestError::InvalidArgument(
                "forward target is outside the captured process tree",
            ));
        }
        if !job.forwarded.contains(&(scope, target)) {
            job.forwarded.push((scope, target));
            job.note(format!("forwarded {} checkpoint to pid {}", scope, target));
        }
        Ok(())
    }
}
