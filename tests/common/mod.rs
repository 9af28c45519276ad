#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use crest::{
    AbortReason, CaptureChannel, CheckpointFlags, CheckpointInfo, CheckpointRequest, Client,
    ClientState, Completion, CrestError, DirectTransport, Dumper, LocalDumper, Pid, RestartInfo,
    Resume, Result, Scope, Token,
};
use crest::Errno;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// What a [`RecordingDumper`] was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Capture(Token),
    Abort(Token, AbortReason),
    Done(Token),
    Forward(Token, Scope, Pid),
}

/// Dumper stand-in driven by calling `Client::interrupt_line().deliver()`
/// directly. Records every handshake call.
pub struct RecordingDumper {
    pub seen: Mutex<Vec<Seen>>,
    pub capture_result: Mutex<std::result::Result<Resume, Errno>>,
    pub refuse_done: AtomicBool,
}

impl RecordingDumper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            capture_result: Mutex::new(Ok(Resume::Continue)),
            refuse_done: AtomicBool::new(false),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn resume_with(&self, r: std::result::Result<Resume, Errno>) {
        *self.capture_result.lock().unwrap() = r;
    }
}

impl CaptureChannel for RecordingDumper {
    fn capture(&self, token: Token, _flags: CheckpointFlags) -> std::result::Result<Resume, Errno> {
        self.seen.lock().unwrap().push(Seen::Capture(token));
        *self.capture_result.lock().unwrap()
    }

    fn abort(&self, token: Token, reason: AbortReason) {
        self.seen.lock().unwrap().push(Seen::Abort(token, reason));
    }

    fn done(&self, token: Token) -> std::result::Result<(), Errno> {
        self.seen.lock().unwrap().push(Seen::Done(token));
        if self.refuse_done.load(Ordering::SeqCst) {
            return Err(Errno(Errno::EINVAL));
        }
        Ok(())
    }
}

impl Dumper for RecordingDumper {
    fn channel(&self) -> &dyn CaptureChannel {
        self
    }

    fn submit(&self, _request: CheckpointRequest) -> Result<Token> {
        Err(CrestError::InvalidArgument("recording dumper takes no requests"))
    }

    fn wait(&self, _token: Token, _timeout: Option<Duration>) -> Result<bool> {
        Ok(true)
    }

    fn reap(&self, _token: Token) -> Result<Completion> {
        Err(CrestError::InvalidArgument("recording dumper takes no requests"))
    }

    fn checkpoint_info(&self, _token: Token) -> Result<CheckpointInfo> {
        Ok(CheckpointInfo {
            requester: 1,
            target: crest_sys::signal::getpid(),
            scope: Scope::Process,
            signal: None,
            dest: PathBuf::from("/dev/null"),
        })
    }

    fn restart_info(&self, _token: Token) -> Result<RestartInfo> {
        Ok(RestartInfo {
            requester: 1,
            src: PathBuf::from("/dev/null"),
        })
    }

    fn forward(&self, token: Token, scope: Scope, target: Pid) -> Result<()> {
        self.seen.lock().unwrap().push(Seen::Forward(token, scope, target));
        Ok(())
    }
}

/// An initialized client wired to a [`RecordingDumper`].
pub fn recording_client() -> (Client, Arc<RecordingDumper>) {
    init_logger();
    let dumper = RecordingDumper::new();
    let client = Client::builder().dumper(dumper.clone()).build();
    client.initialize().unwrap();
    (client, dumper)
}

/// An initialized client wired to the in-process dumper.
pub fn local_client() -> (Client, Arc<LocalDumper>) {
    init_logger();
    let transport = Arc::new(DirectTransport::new());
    let dumper = Arc::new(LocalDumper::new(transport.clone(), 2));
    let client = Client::builder()
        .transport(transport)
        .dumper(dumper.clone())
        .build();
    client.initialize().unwrap();
    (client, dumper)
}

/// Spin until the client reaches `state`, or panic after a few seconds.
pub fn wait_for_state(client: &Client, state: ClientState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while client.status().unwrap() != state {
        assert!(Instant::now() < deadline, "client never reached {:?}", state);
        thread::sleep(Duration::from_millis(5));
    }
}
