//! Requesting a checkpoint of this process and polling for the result.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crest_sys::fd::is_writable;

use crate::callback::CallbackContext;
use crate::client::{Client, Inner};
use crate::dumper::{CheckpointArgs, CheckpointRequest, CompletionStatus, Scope, Token};
use crate::error::{CrestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Not finished within the timeout.
    Pending,
    /// The image was written and this process continued.
    Completed,
    /// This process is running again from the image.
    Restarted,
}

/// An outstanding checkpoint request.
///
/// Polling to a terminal result closes the destination and invalidates the
/// handle. Only one request per client may be outstanding; dropping an
/// unfinished handle gives up on its result and frees the client for the
/// next request.
#[derive(Debug)]
pub struct RequestHandle {
    token: Option<Token>,
    messages: Vec<String>,
    client: Weak<Inner>,
}

impl RequestHandle {
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_finished(&self) -> bool {
        self.token.is_none()
    }

    /// Dumper log for the request, available once it has finished.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        let token = match self.token.take() {
            Some(t) => t,
            None => return,
        };
        if let Some(inner) = self.client.upgrade() {
            log::debug!("Request {} dropped before completion", token);
            inner.dumper.discard(token);
            inner.outstanding.store(false, Ordering::SeqCst);
        }
    }
}

impl Client {
    /// Ask for a checkpoint of this process, written to `dest`.
    pub fn request(&self, scope: Scope, dest: File) -> Result<RequestHandle> {
        self.request_with(CheckpointArgs::new(scope), dest)
    }

    pub fn request_with(&self, args: CheckpointArgs, dest: File) -> Result<RequestHandle> {
        let inner = &self.inner;
        let r = inner.usable().and_then(|_| {
            if inner.is_runner() {
                return Err(CrestError::Busy);
            }
            if !is_writable(dest.as_raw_fd()).map_err(io::Error::from)? {
                return Err(CrestError::InvalidArgument(
                    "destination is not open for writing",
                ));
            }
            // A forked child has no helper until it is needed again.
            if inner.registry.has_context(CallbackContext::Thread) {
                inner.helper.ensure_started(Arc::downgrade(inner))?;
            }
            if inner.outstanding.swap(true, Ordering::SeqCst) {
                return Err(CrestError::Busy);
            }
            match inner.dumper.submit(CheckpointRequest { args, dest }) {
                Ok(token) => Ok(RequestHandle {
                    token: Some(token),
                    messages: Vec::new(),
                    client: Arc::downgrade(inner),
                }),
                Err(e) => {
                    inner.outstanding.store(false, Ordering::SeqCst);
                    Err(e)
                }
            }
        });
        self.track(r)
    }

    /// Wait up to `timeout` (`None` for no limit) for `handle` to finish.
    ///
    /// Calling this with no limit while holding a critical section on the
    /// same client never returns: the checkpoint waits for the section.
    pub fn poll(&self, handle: &mut RequestHandle, timeout: Option<Duration>) -> Result<PollStatus> {
        let r = self.poll_inner(handle, timeout);
        self.track(r)
    }

    fn poll_inner(&self, handle: &mut RequestHandle, timeout: Option<Duration>) -> Result<PollStatus> {
        let inner = &self.inner;
        inner.usable()?;
        let token = handle
            .token
            .ok_or(CrestError::InvalidArgument("request already finished"))?;
        if !inner.dumper.wait(token, timeout)? {
            return Ok(PollStatus::Pending);
        }
        let completion = inner.dumper.reap(token)?;
        handle.token = None;
        handle.messages = completion.messages;
        inner.outstanding.store(false, Ordering::SeqCst);
        match completion.status {
            CompletionStatus::Completed => Ok(PollStatus::Completed),
            CompletionStatus::Restarted => Ok(PollStatus::Restarted),
            CompletionStatus::Aborted(reason) => Err(CrestError::Aborted(reason)),
            CompletionStatus::Failed(e) => Err(CrestError::PollFailed(e)),
        }
    }

    /// Checkpoint this process into `path` and wait for the result.
    ///
    /// The file is created (or truncated) with mode 0600 and removed again
    /// if the checkpoint fails.
    pub fn checkpoint_to_file(&self, path: impl AsRef<Path>) -> Result<PollStatus> {
        let path = path.as_ref();
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => return self.track(Err(e.into())),
        };
        let result = self
            .request(Scope::Process, file)
            .and_then(|mut handle| self.poll(&mut handle, None));
        if result.is_err() {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        result
    }
}
