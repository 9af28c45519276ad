//! Fixed table of internal override points.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::callback::Resume;
use crate::error::{CrestError, Result};

pub const NUM_HOOKS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HookEvent {
    ContinueNoCallbacks = 0,
    RestartNoCallbacks = 1,
    ContinueSignalContext = 2,
    RestartSignalContext = 3,
    ContinueThreadContext = 4,
    RestartThreadContext = 5,
}

impl HookEvent {
    pub fn from_slot(slot: i32) -> Option<Self> {
        use HookEvent::*;
        Some(match slot {
            0 => ContinueNoCallbacks,
            1 => RestartNoCallbacks,
            2 => ContinueSignalContext,
            3 => RestartSignalContext,
            4 => ContinueThreadContext,
            5 => RestartThreadContext,
            _ => return None,
        })
    }

    pub(crate) fn no_callbacks(resume: Resume) -> Self {
        match resume {
            Resume::Continue => HookEvent::ContinueNoCallbacks,
            Resume::Restart => HookEvent::RestartNoCallbacks,
        }
    }

    pub(crate) fn signal_context(resume: Resume) -> Self {
        match resume {
            Resume::Continue => HookEvent::ContinueSignalContext,
            Resume::Restart => HookEvent::RestartSignalContext,
        }
    }

    pub(crate) fn thread_context(resume: Resume) -> Self {
        match resume {
            Resume::Continue => HookEvent::ContinueThreadContext,
            Resume::Restart => HookEvent::RestartThreadContext,
        }
    }
}

pub type HookFn = fn(HookEvent);

/// Content of a hook slot.
#[derive(Debug, Clone, Copy, Eq)]
pub enum Hook {
    /// Built-in behavior (nothing).
    Default,
    /// Reserved sentinel; never accepted as a new value.
    Error,
    Run(HookFn),
}

impl PartialEq for Hook {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Hook::Default, Hook::Default) | (Hook::Error, Hook::Error) => true,
            (Hook::Run(a), Hook::Run(b)) => std::ptr::fn_addr_eq(*a, *b),
            _ => false,
        }
    }
}

/// Slots hold the function address, zero meaning default.
pub(crate) struct HookTable {
    slots: [AtomicUsize; NUM_HOOKS],
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);

impl HookTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; NUM_HOOKS],
        }
    }

    pub(crate) fn set(&self, slot: i32, hook: Hook) -> Result<Hook> {
        let event = match HookEvent::from_slot(slot) {
            Some(e) => e,
            None => return Err(CrestError::InvalidArgument("hook slot out of range")),
        };
        let raw = match hook {
            Hook::Default => 0,
            Hook::Run(f) => f as usize,
            Hook::Error => return Err(CrestError::InvalidArgument("reserved hook value")),
        };
        let old = self.slots[event as usize].swap(raw, Ordering::AcqRel);
        Ok(Self::decode(old))
    }

    pub(crate) fn get(&self, event: HookEvent) -> Hook {
        Self::decode(self.slots[event as usize].load(Ordering::Acquire))
    }

    /// Run the hook for `event`, if one is installed. Signal-safe.
    #[inline(always)]
    pub(crate) fn run(&self, event: HookEvent) {
        if let Hook::Run(f) = self.get(event) {
            f(event);
        }
    }

    fn decode(raw: usize) -> Hook {
        if raw == 0 {
            Hook::Default
        } else {
            // Only addresses of `HookFn` values are ever stored.
            Hook::Run(unsafe { std::mem::transmute::<usize, HookFn>(raw) })
        }
    }
}
