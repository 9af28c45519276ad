//! The dumper side of the protocol.
//!
//! A [`Dumper`] accepts checkpoint requests, interrupts the target and
//! produces the image. The client never touches images itself: it drives
//! its callbacks and then hands control to the dumper's [`CaptureChannel`]
//! for the actual capture.

pub mod local;

use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crest_sys::Errno;

use crate::callback::Resume;
use crate::error::{AbortReason, CrestError, Result};

pub use local::LocalDumper;

pub type Pid = libc::pid_t;

/// Identifies one checkpoint request from submission to reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub(crate) usize);

impl Token {
    pub const fn new(raw: usize) -> Self {
        Token(raw)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The target process alone.
    Process,
    /// The target and all of its descendants.
    Tree,
}

impl Scope {
    pub fn as_raw(self) -> i32 {
        match self {
            Scope::Process => 1,
            Scope::Tree => 2,
        }
    }
}

impl TryFrom<i32> for Scope {
    type Error = CrestError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            1 => Ok(Scope::Process),
            2 => Ok(Scope::Tree),
            _ => Err(CrestError::InvalidArgument("unknown checkpoint scope")),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Process => "process",
            Scope::Tree => "tree",
        })
    }
}

/// How the client finished its checkpoint half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFlags {
    Ready,
    TempFailure,
    PermFailure,
    Omit,
}

impl CheckpointFlags {
    pub fn abort_reason(self) -> Option<AbortReason> {
        match self {
            CheckpointFlags::Ready => None,
            CheckpointFlags::TempFailure => Some(AbortReason::TempFailure),
            CheckpointFlags::PermFailure => Some(AbortReason::PermFailure),
            CheckpointFlags::Omit => Some(AbortReason::Omitted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointArgs {
    pub scope: Scope,
    /// `None` targets the calling process.
    pub target: Option<Pid>,
    /// Signal sent to the target once the image is complete.
    pub signal: Option<i32>,
}

impl CheckpointArgs {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            target: None,
            signal: None,
        }
    }
}

impl Default for CheckpointArgs {
    fn default() -> Self {
        Self::new(Scope::Process)
    }
}

pub struct CheckpointRequest {
    pub args: CheckpointArgs,
    pub dest: File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub requester: Pid,
    pub target: Pid,
    pub scope: Scope,
    pub signal: Option<i32>,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartInfo {
    pub requester: Pid,
    pub src: PathBuf,
}

#[derive(Debug)]
pub enum CompletionStatus {
    Completed,
    Restarted,
    Aborted(AbortReason),
    Failed(io::Error),
}

/// Terminal result of a request plus the dumper's log for it.
#[derive(Debug)]
pub struct Completion {
    pub status: CompletionStatus,
    pub messages: Vec<String>,
}

/// Capture handshake used from the interrupt path.
///
/// Implementations must be async-signal-safe: no allocation, no locks that
/// the interrupted thread could hold.
pub trait CaptureChannel: Send + Sync {
    /// Capture the process now. Blocks until the image is taken.
    fn capture(&self, token: Token, flags: CheckpointFlags) -> std::result::Result<Resume, Errno>;

    /// Report that this process will not be captured.
    fn abort(&self, token: Token, reason: AbortReason);

    /// The client has finished its resume half.
    fn done(&self, token: Token) -> std::result::Result<(), Errno>;
}

pub trait Dumper: Send + Sync {
    fn channel(&self) -> &dyn CaptureChannel;

    fn submit(&self, request: CheckpointRequest) -> Result<Token>;

    /// Wait until `token` has a result. `Ok(false)` on timeout.
    fn wait(&self, token: Token, timeout: Option<Duration>) -> Result<bool>;

    fn reap(&self, token: Token) -> Result<Completion>;

    /// Nobody will reap `token`; free it once it finishes.
    fn discard(&self, _token: Token) {}

    fn checkpoint_info(&self, token: Token) -> Result<CheckpointInfo>;

    fn restart_info(&self, token: Token) -> Result<RestartInfo>;

    /// Extend the request behind `token` to `target`.
    fn forward(&self, token: Token, scope: Scope, target: Pid) -> Result<()>;
}
