//! How a checkpoint notification reaches the client.

use std::io;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use crest_sys::signal::{self, SI_QUEUE};
use crest_sys::Errno;

use crate::callback::Resume;
use crate::client::Inner;
use crate::dumper::Token;
use crate::error::{CrestError, Result};

/// What happened to one delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No section was held; the checkpoint ran on the delivering thread.
    Ran(Resume),
    /// Deferred until the last critical section is left.
    Deferred,
    /// A checkpoint was already pending or running.
    Coalesced,
    /// The client is not accepting checkpoints.
    Rejected,
}

/// Delivery endpoint of one client, handed to its transport.
#[derive(Clone)]
pub struct InterruptLine {
    inner: Weak<Inner>,
}

impl InterruptLine {
    pub(crate) fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    /// Deliver a notification. Async-signal-safe.
    pub fn deliver(&self, token: Token) -> Delivery {
        match self.inner.upgrade() {
            Some(inner) => inner.on_interrupt(token),
            None => Delivery::Rejected,
        }
    }

    fn same_client(&self, other: &InterruptLine) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

pub trait InterruptTransport: Send + Sync {
    /// Bind the transport to a client. Called once during initialization.
    fn install(&self, line: InterruptLine) -> Result<()>;

    /// Interrupt the bound client for `token`.
    fn raise(&self, token: Token) -> Result<()>;
}

/// Delivers notifications by calling the client from a fresh thread.
#[derive(Default)]
pub struct DirectTransport {
    line: OnceLock<InterruptLine>,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterruptTransport for DirectTransport {
    fn install(&self, line: InterruptLine) -> Result<()> {
        let bound = self.line.get_or_init(|| line.clone());
        if !bound.same_client(&line) {
            return Err(CrestError::NotInitializable(
                "transport is bound to another client".to_string(),
            ));
        }
        Ok(())
    }

    fn raise(&self, token: Token) -> Result<()> {
        let line = match self.line.get() {
            Some(l) => l.clone(),
            None => return Err(CrestError::NotInitialized),
        };
        thread::Builder::new()
            .name("crest-interrupt".to_string())
            .spawn(move || {
                let delivery = line.deliver(token);
                log::debug!("Delivered checkpoint {}: {:?}", token, delivery);
            })?;
        Ok(())
    }
}

static SIGNAL_LINE: OnceLock<InterruptLine> = OnceLock::new();

/// Delivers notifications as a queued real-time signal to this process.
///
/// Only one client per process can own the signal.
pub struct SignalTransport {
    signum: i32,
}

impl SignalTransport {
    pub fn new(signum: i32) -> Self {
        Self { signum }
    }

    pub fn signum(&self) -> i32 {
        self.signum
    }
}

impl InterruptTransport for SignalTransport {
    fn install(&self, line: InterruptLine) -> Result<()> {
        let bound = SIGNAL_LINE.get_or_init(|| line.clone());
        if !bound.same_client(&line) {
            return Err(CrestError::NotInitializable(
                "checkpoint signal is owned by another client".to_string(),
            ));
        }
        let ours = on_checkpoint_signal as signal::SigHandler as usize;
        let current = signal::current_handler(self.signum)
            .map_err(|e| CrestError::NotInitializable(format!("sigaction: {}", e)))?;
        if current == ours {
            return Ok(());
        }
        if current != libc::SIG_DFL && current != libc::SIG_IGN {
            return Err(CrestError::NotInitializable(format!(
                "signal {} already has a handler",
                self.signum
            )));
        }
        signal::install(self.signum, on_checkpoint_signal)
            .map_err(|e| CrestError::NotInitializable(format!("sigaction: {}", e)))?;
        log::info!("Checkpoint signal {} installed", self.signum);
        Ok(())
    }

    fn raise(&self, token: Token) -> Result<()> {
        signal::queue(signal::getpid(), self.signum, token.as_usize()).map_err(io::Error::from)?;
        Ok(())
    }
}

extern "C" fn on_checkpoint_signal(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let saved = Errno::last();
    let (pid, code, value) = unsafe { signal::info_parts(info) };
    // Anything not queued by this process is a stray.
    if code == SI_QUEUE && pid == signal::getpid() {
        if let Some(line) = SIGNAL_LINE.get() {
            line.deliver(Token::new(value));
        }
    }
    saved.restore();
}
