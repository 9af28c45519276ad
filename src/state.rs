//! Client lifecycle state machine.

use crest_sys::AtomicWord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(isize)]
pub enum ClientState {
    Uninitialized = 0,
    Idle = 1,
    /// A checkpoint notification was accepted and waits for the gate.
    Pending = 2,
    /// Callbacks and capture are running.
    Active = 3,
    /// Unrecoverable internal fault.
    Error = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Initialize,
    Interrupt,
    Start,
    Finish,
    Fault,
}

impl ClientState {
    fn from_word(w: isize) -> Self {
        match w {
            0 => ClientState::Uninitialized,
            1 => ClientState::Idle,
            2 => ClientState::Pending,
            3 => ClientState::Active,
            _ => ClientState::Error,
        }
    }

    /// Successor for `event`, or `None` if the event is illegal here.
    ///
    /// Repeat interrupts while a checkpoint is pending or running map back to
    /// the same state: they are coalesced, never queued.
    pub fn on(self, event: StateEvent) -> Option<ClientState> {
        use ClientState::*;
        use StateEvent::*;
        match (self, event) {
            (_, Fault) => Some(Error),
            (Error, _) => None,
            (Uninitialized, Initialize) => Some(Idle),
            (Uninitialized, _) => None,
            (s, Initialize) => Some(s),
            (Idle, Interrupt) => Some(Pending),
            (Pending, Interrupt) => Some(Pending),
            (Active, Interrupt) => Some(Active),
            (Pending, Start) => Some(Active),
            (Active, Finish) => Some(Idle),
            _ => None,
        }
    }
}

/// State word shared with the interrupt path.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicWord);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicWord::new(ClientState::Uninitialized as isize))
    }

    #[inline(always)]
    pub(crate) fn get(&self) -> ClientState {
        ClientState::from_word(self.0.read())
    }

    /// Apply `event` iff the state is still `from`.
    ///
    /// Returns the new state, or `None` if the state moved underneath us or
    /// the event is illegal.
    #[inline(always)]
    pub(crate) fn apply_from(&self, from: ClientState, event: StateEvent) -> Option<ClientState> {
        let to = from.on(event)?;
        if self.0.cmp_swap(from as isize, to as isize) {
            Some(to)
        } else {
            None
        }
    }

    #[inline(always)]
    pub(crate) fn force(&self, to: ClientState) {
        self.0.write(to as isize);
    }
}
