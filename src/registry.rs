//! Callback table.
//!
//! Writers serialize on a mutex; the interrupt path only reads. Entries are
//! written into their slot before the length is published, and replaced
//! entries are retired rather than freed, so a reader never sees a partial
//! entry or a dangling one.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::callback::{Callback, CallbackContext, CallbackId};
use crate::error::{CrestError, Result};

pub(crate) struct Entry {
    pub(crate) handler: Arc<dyn Callback>,
    pub(crate) arg: usize,
    pub(crate) context: CallbackContext,
}

pub(crate) struct Registry {
    slots: Box<[AtomicPtr<Entry>]>,
    len: AtomicUsize,
    retired: Mutex<Vec<Box<Entry>>>,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            len: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> Option<&Entry> {
        if index >= self.len() {
            return None;
        }
        let p = self.slots[index].load(Ordering::Acquire);
        // Published slots are never null and never freed before the table.
        unsafe { p.as_ref() }
    }

    pub(crate) fn has_context(&self, context: CallbackContext) -> bool {
        (0..self.len()).any(|i| self.get(i).map_or(false, |e| e.context == context))
    }

    pub(crate) fn register(&self, entry: Entry) -> Result<CallbackId> {
        let _writer = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        let index = self.len.load(Ordering::Relaxed);
        if index >= self.slots.len() {
            return Err(CrestError::NoSpace(self.slots.len()));
        }
        self.slots[index].store(Box::into_raw(Box::new(entry)), Ordering::Release);
        self.len.store(index + 1, Ordering::Release);
        Ok(CallbackId(index))
    }

    pub(crate) fn replace(&self, id: CallbackId, entry: Entry) -> Result<CallbackId> {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        let old = match self.get(id.0) {
            Some(e) => e,
            None => return Err(CrestError::InvalidArgument("unknown callback id")),
        };
        if old.context != entry.context {
            return Err(CrestError::InvalidArgument("callback context cannot change"));
        }
        let new = Box::into_raw(Box::new(entry));
        let old = self.slots[id.0].swap(new, Ordering::AcqRel);
        // A reader may still be running the old handler.
        retired.push(unsafe { Box::from_raw(old) });
        Ok(id)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let len = *self.len.get_mut();
        for slot in &mut self.slots[..len] {
            let p = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}
