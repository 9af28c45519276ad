//! The checkpoint client: lifecycle, critical sections and registration.
//!
//! A [`Client`] is a cheap handle around shared state. Most processes use
//! the single process-wide client from [`crate::initialize`]; tests and
//! embedders can build private ones with [`ClientBuilder`].

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crest_sys::signal::{getpid, gettid, write_stderr, yield_now};
use crest_sys::AtomicWord;

use crate::callback::{Callback, CallbackContext, CallbackId, Resume};
use crate::config::{Config, FaultPolicy};
use crate::dumper::{CheckpointInfo, Dumper, LocalDumper, RestartInfo, Scope, Token};
use crate::error::{self, CrestError, ErrorCode, Result};
use crate::fork;
use crate::gate::Gate;
use crate::helper::Helper;
use crate::hooks::{Hook, HookTable};
use crate::persist::PersistCounter;
use crate::registry::{Entry, Registry};
use crate::run::RunState;
use crate::state::{ClientState, StateCell, StateEvent};
use crate::transport::{DirectTransport, InterruptLine, InterruptTransport};

static NEXT_CLIENT: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// Critical sections entered, and not yet left, by this thread.
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// Identity handed out by [`Client::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        let seq = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        ClientId(((getpid() as u64) << 32) | seq as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

/// Result of a non-blocking section entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryEnter {
    /// The section is held and must be left.
    Entered,
    /// A checkpoint is pending or running. Nothing is held.
    Pending,
    /// The call completed a pending checkpoint. Nothing is held.
    Checkpointed(Resume),
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) state: StateCell,
    pub(crate) gate: Gate,
    pub(crate) persist: PersistCounter,
    pub(crate) registry: Registry,
    pub(crate) hooks: HookTable,
    pub(crate) helper: Helper,
    pub(crate) run: RunState,
    pub(crate) dumper: Arc<dyn Dumper>,
    pub(crate) transport: Arc<dyn InterruptTransport>,
    pub(crate) outstanding: AtomicBool,
    id: OnceLock<ClientId>,
    init_lock: Mutex<()>,
    last_error: AtomicWord,
}

impl Inner {
    fn initialize(self: &Arc<Self>) -> Result<ClientId> {
        let _init = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = self.id.get() {
            return Ok(*id);
        }
        self.transport.install(InterruptLine::new(self))?;
        let id = *self.id.get_or_init(ClientId::next);
        if self
            .state
            .apply_from(ClientState::Uninitialized, StateEvent::Initialize)
            .is_none()
        {
            return Err(CrestError::NotInitializable(
                "client left the uninitialized state early".to_string(),
            ));
        }
        fork::track(self);
        log::info!("Checkpoint client {} initialized", id);
        Ok(id)
    }

    /// Fails unless the client accepts protocol calls.
    #[inline(always)]
    pub(crate) fn usable(&self) -> Result<()> {
        match self.state.get() {
            ClientState::Uninitialized => Err(CrestError::NotInitialized),
            ClientState::Error => Err(CrestError::Faulted("client is in the error state")),
            _ => Ok(()),
        }
    }

    #[inline(always)]
    pub(crate) fn is_runner(&self) -> bool {
        self.run.runner.read() == gettid() as isize
    }

    /// True while the calling thread is executing one of our callbacks.
    pub(crate) fn in_callback(&self) -> bool {
        self.state.get() == ClientState::Active && self.is_runner() && self.run.current.read() >= 0
    }

    pub(crate) fn current_token(&self) -> Token {
        Token::new(self.run.token.read() as usize)
    }

    /// Unrecoverable fault. May run in interrupt context.
    pub(crate) fn fault(&self, what: &'static str) {
        self.state.force(ClientState::Error);
        write_stderr(b"crest: internal fault: ");
        write_stderr(what.as_bytes());
        write_stderr(b"\n");
        if self.config.fault_policy == FaultPolicy::Abort {
            std::process::abort();
        }
    }

    /// Child side of `fork()`. Sections, the checkpoint in flight, the
    /// outstanding request and the helper thread all belonged to the parent.
    pub(crate) fn after_fork(&self) {
        HELD.set(0);
        self.gate.reset();
        self.run.after_fork();
        self.outstanding.store(false, Ordering::SeqCst);
        self.helper.after_fork();
        if matches!(self.state.get(), ClientState::Pending | ClientState::Active) {
            self.state.force(ClientState::Idle);
        }
    }

    fn enter(&self) -> Result<()> {
        self.usable()?;
        if self.is_runner() {
            return Ok(());
        }
        // An outermost entry waits out a pending checkpoint so that
        // overlapping sections on other threads cannot starve it.
        let outermost = HELD.get() == 0;
        while !self.gate.try_increment(outermost) {
            yield_now();
            self.usable()?;
        }
        HELD.set(HELD.get() + 1);
        Ok(())
    }

    fn try_enter(&self) -> Result<TryEnter> {
        self.usable()?;
        if self.is_runner() {
            return Ok(TryEnter::Entered);
        }
        let outermost = HELD.get() == 0;
        if !self.gate.try_increment(outermost) {
            return Ok(TryEnter::Pending);
        }
        if outermost && self.state.get() == ClientState::Pending {
            // The interrupt landed between our increment and this check.
            return Ok(if self.gate.decrement()? {
                TryEnter::Checkpointed(self.run_checkpoint())
            } else {
                TryEnter::Pending
            });
        }
        HELD.set(HELD.get() + 1);
        Ok(TryEnter::Entered)
    }

    fn leave(&self) -> Result<Resume> {
        self.usable()?;
        if self.is_runner() {
            return Ok(Resume::Continue);
        }
        let owns = self.gate.decrement()?;
        HELD.set(HELD.get().saturating_sub(1));
        if owns {
            Ok(self.run_checkpoint())
        } else {
            Ok(Resume::Continue)
        }
    }

    fn register(
        self: &Arc<Self>,
        handler: Arc<dyn Callback>,
        arg: usize,
        context: CallbackContext,
    ) -> Result<CallbackId> {
        self.usable()?;
        if self.is_runner() {
            return Err(CrestError::Busy);
        }
        if context == CallbackContext::Thread {
            self.helper.ensure_started(Arc::downgrade(self))?;
        }
        let id = self.registry.register(Entry {
            handler,
            arg,
            context,
        })?;
        log::debug!("Registered {:?} callback {}", context, id);
        Ok(id)
    }

    /// Swap the entry behind `id`. Only the callback running in `id` may
    /// do this.
    fn replace(
        &self,
        id: CallbackId,
        handler: Arc<dyn Callback>,
        arg: usize,
        context: CallbackContext,
    ) -> Result<CallbackId> {
        self.usable()?;
        if !self.in_callback() {
            return Err(CrestError::NotInCallback);
        }
        if self.run.current.read() != id.0 as isize {
            return Err(CrestError::InvalidArgument("callback id is not the running callback"));
        }
        self.registry.replace(
            id,
            Entry {
                handler,
                arg,
                context,
            },
        )
    }

    fn replace_self(
        &self,
        handler: Arc<dyn Callback>,
        arg: usize,
        context: CallbackContext,
    ) -> Result<CallbackId> {
        self.usable()?;
        if !self.in_callback() {
            return Err(CrestError::NotInCallback);
        }
        let id = CallbackId(self.run.current.read() as usize);
        self.replace(id, handler, arg, context)
    }

    fn callback_token(&self) -> Result<Token> {
        self.usable()?;
        if !self.in_callback() {
            return Err(CrestError::NotInCallback);
        }
        Ok(self.current_token())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        fork::forget(self);
        self.helper.shutdown();
    }
}

#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id.get())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn new(
        config: Config,
        dumper: Arc<dyn Dumper>,
        transport: Arc<dyn InterruptTransport>,
    ) -> Self {
        let inner = Inner {
            registry: Registry::new(config.max_callbacks),
            config,
            state: StateCell::new(),
            gate: Gate::new(),
            persist: PersistCounter::new(),
            hooks: HookTable::new(),
            helper: Helper::new(),
            run: RunState::new(),
            dumper,
            transport,
            outstanding: AtomicBool::new(false),
            id: OnceLock::new(),
            init_lock: Mutex::new(()),
            last_error: AtomicWord::new(0),
        };
        Client {
            inner: Arc::new(inner),
        }
    }

    /// Record a failure in the per-thread and per-client error slots.
    pub(crate) fn track<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            error::record(e);
            self.inner.last_error.write(e.code() as isize);
        }
        r
    }

    /// Join the checkpoint protocol. Idempotent.
    pub fn initialize(&self) -> Result<ClientId> {
        self.track(self.inner.initialize())
    }

    pub fn id(&self) -> Option<ClientId> {
        self.inner.id.get().copied()
    }

    pub fn status(&self) -> Result<ClientState> {
        let r = match self.inner.state.get() {
            ClientState::Uninitialized => Err(CrestError::NotInitialized),
            state => Ok(state),
        };
        self.track(r)
    }

    /// Critical sections currently held across all threads.
    pub fn depth(&self) -> usize {
        self.inner.gate.depth()
    }

    /// Enter a critical section, waiting out a running checkpoint.
    ///
    /// A no-op on the thread running the checkpoint.
    pub fn enter_critical(&self) -> Result<()> {
        self.track(self.inner.enter())
    }

    pub fn try_enter_critical(&self) -> Result<TryEnter> {
        self.track(self.inner.try_enter())
    }

    /// Leave a critical section. Leaving the last one runs any deferred
    /// checkpoint before returning.
    pub fn leave_critical(&self) -> Result<Resume> {
        self.track(self.inner.leave())
    }

    /// Run `f` inside a critical section.
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> Result<(R, Resume)> {
        self.enter_critical()?;
        let out = f();
        let resume = self.leave_critical()?;
        Ok((out, resume))
    }

    pub fn register_callback<C>(&self, handler: C, arg: usize, context: CallbackContext) -> Result<CallbackId>
    where
        C: Callback + 'static,
    {
        self.track(self.inner.register(Arc::new(handler), arg, context))
    }

    /// Swap the handler behind `id` from inside that callback. The context
    /// cannot change.
    pub fn replace_callback<C>(
        &self,
        id: CallbackId,
        handler: C,
        arg: usize,
        context: CallbackContext,
    ) -> Result<CallbackId>
    where
        C: Callback + 'static,
    {
        self.track(self.inner.replace(id, Arc::new(handler), arg, context))
    }

    /// Replace the callback that is currently running.
    pub fn replace_self<C>(&self, handler: C, arg: usize, context: CallbackContext) -> Result<CallbackId>
    where
        C: Callback + 'static,
    {
        self.track(self.inner.replace_self(Arc::new(handler), arg, context))
    }

    /// Install `hook` in `slot`, returning the previous one.
    pub fn register_hook(&self, slot: i32, hook: Hook) -> Result<Hook> {
        self.track(
            self.inner
                .usable()
                .and_then(|_| self.inner.hooks.set(slot, hook)),
        )
    }

    /// Returns the count before the increment.
    pub fn increment_persist(&self) -> Result<usize> {
        self.track(self.inner.usable().and_then(|_| self.inner.persist.increment()))
    }

    /// Returns the count before the decrement.
    pub fn decrement_persist(&self) -> Result<usize> {
        self.track(self.inner.usable().and_then(|_| self.inner.persist.decrement()))
    }

    pub fn persist_count(&self) -> usize {
        self.inner.persist.get()
    }

    /// Details of the checkpoint being taken. Callbacks only.
    pub fn checkpoint_info(&self) -> Result<CheckpointInfo> {
        self.track(
            self.inner
                .callback_token()
                .and_then(|t| self.inner.dumper.checkpoint_info(t)),
        )
    }

    /// Details of the restart in progress. Callbacks only.
    pub fn restart_info(&self) -> Result<RestartInfo> {
        self.track(
            self.inner
                .callback_token()
                .and_then(|t| self.inner.dumper.restart_info(t)),
        )
    }

    /// Extend the current checkpoint to `target` (`None` for self).
    /// Callbacks only.
    pub fn forward(&self, scope: Scope, target: Option<libc::pid_t>) -> Result<()> {
        let r = self.inner.callback_token().and_then(|t| {
            self.inner
                .dumper
                .forward(t, scope, target.unwrap_or_else(getpid))
        });
        self.track(r)
    }

    /// Code of the last error any call on this client reported.
    pub fn last_error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.inner.last_error.read() as i32)
    }

    /// Endpoint transports deliver notifications to.
    pub fn interrupt_line(&self) -> InterruptLine {
        InterruptLine::new(&self.inner)
    }
}

/// Builds a private client. Defaults to the in-process dumper on a direct
/// transport.
#[derive(Default)]
pub struct ClientBuilder {
    config: Option<Config>,
    dumper: Option<Arc<dyn Dumper>>,
    transport: Option<Arc<dyn InterruptTransport>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn dumper(mut self, dumper: Arc<dyn Dumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn InterruptTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Client {
        let config = self.config.unwrap_or_default();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(DirectTransport::new()));
        let dumper = self.dumper.unwrap_or_else(|| {
            Arc::new(LocalDumper::new(transport.clone(), config.dumper_slots))
        });
        Client::new(config, dumper, transport)
    }
}
