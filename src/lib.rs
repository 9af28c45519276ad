//! Client-side checkpoint/restart coordination.
//!
//! A process joins the protocol with [`initialize`], brackets code that must
//! not be interrupted by a checkpoint with critical sections, and registers
//! callbacks that run on both sides of every checkpoint. Checkpoints of the
//! calling process are requested with [`Client::request`] and collected with
//! [`Client::poll`].

pub mod callback;
pub mod client;
pub mod config;
pub mod dumper;
pub mod error;
mod fork;
mod gate;
mod global;
mod helper;
pub mod hooks;
pub mod image;
pub mod persist;
pub mod procfs;
pub mod proto;
mod registry;
pub mod request;
mod run;
pub mod state;
pub mod transport;

pub use callback::{Callback, CallbackContext, CallbackEvent, CallbackId, Resume, Verdict};
pub use client::{Client, ClientBuilder, ClientId, TryEnter};
pub use config::{Config, FaultPolicy};
pub use dumper::{
    CaptureChannel, CheckpointArgs, CheckpointFlags, CheckpointInfo, CheckpointRequest, Completion,
    CompletionStatus, Dumper, LocalDumper, Pid, RestartInfo, Scope, Token,
};
pub use error::{error_to_string, last_error, AbortReason, CrestError, ErrorCode, Result};
pub use global::{client, initialize};
pub use hooks::{Hook, HookEvent, HookFn, NUM_HOOKS};
pub use request::{PollStatus, RequestHandle};
pub use state::ClientState;
pub use crest_sys::Errno;
pub use transport::{Delivery, DirectTransport, InterruptLine, InterruptTransport, SignalTransport};
