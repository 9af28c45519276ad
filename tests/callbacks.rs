//! Callback ordering, vetoes, hooks and in-callback operations.

mod common;

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::Seen;
use crest::{
    AbortReason, CallbackContext, CallbackEvent, CheckpointFlags, Client, ClientState, CrestError,
    Delivery, Hook, HookEvent, Resume, Scope, Token, Verdict,
};

type Log = Arc<Mutex<Vec<String>>>;

fn logger(log: Log, name: &'static str, verdict: Verdict) -> impl Fn(CallbackEvent, usize) -> Verdict + Send + Sync {
    move |event, _| {
        let half = match event {
            CallbackEvent::Checkpoint => "ckpt",
            CallbackEvent::Resume(Resume::Continue) => "cont",
            CallbackEvent::Resume(Resume::Restart) => "rstrt",
        };
        log.lock().unwrap().push(format!("{}:{}", name, half));
        if event == CallbackEvent::Checkpoint {
            verdict
        } else {
            Verdict::Proceed
        }
    }
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn test_both_halves_in_registration_order() {
    let (c, _) = common::recording_client();
    let log: Log = Arc::default();
    for name in ["A", "B", "C"] {
        c.register_callback(logger(log.clone(), name, Verdict::Proceed), 0, CallbackContext::Signal)
            .unwrap();
    }
    assert_eq!(
        c.interrupt_line().deliver(Token::new(1)),
        Delivery::Ran(Resume::Continue)
    );
    assert_eq!(
        entries(&log),
        ["A:ckpt", "B:ckpt", "C:ckpt", "A:cont", "B:cont", "C:cont"]
    );
}

#[test]
fn test_restart_is_reported_to_every_callback() {
    let (c, d) = common::recording_client();
    d.resume_with(Ok(Resume::Restart));
    let log: Log = Arc::default();
    c.register_callback(logger(log.clone(), "A", Verdict::Proceed), 0, CallbackContext::Signal)
        .unwrap();
    c.register_callback(logger(log.clone(), "B", Verdict::Proceed), 0, CallbackContext::Thread)
        .unwrap();

    c.enter_critical().unwrap();
    assert_eq!(c.interrupt_line().deliver(Token::new(2)), Delivery::Deferred);
    assert_eq!(c.leave_critical().unwrap(), Resume::Restart);
    assert_eq!(entries(&log), ["A:ckpt", "B:ckpt", "A:rstrt", "B:rstrt"]);
}

#[test]
fn test_abort_skips_later_callbacks_and_resumes_earlier_ones() {
    let (c, d) = common::recording_client();
    let log: Log = Arc::default();
    c.register_callback(logger(log.clone(), "A", Verdict::Proceed), 0, CallbackContext::Signal)
        .unwrap();
    c.register_callback(logger(log.clone(), "B", Verdict::Abort), 0, CallbackContext::Signal)
        .unwrap();
    c.register_callback(logger(log.clone(), "C", Verdict::Proceed), 0, CallbackContext::Signal)
        .unwrap();

    assert_eq!(
        c.interrupt_line().deliver(Token::new(4)),
        Delivery::Ran(Resume::Continue)
    );
    assert_eq!(entries(&log), ["A:ckpt", "B:ckpt", "A:cont", "B:cont"]);
    assert_eq!(
        d.seen(),
        vec![
            Seen::Abort(Token::new(4), AbortReason::PermFailure),
            Seen::Done(Token::new(4))
        ]
    );
    assert_eq!(c.status().unwrap(), ClientState::Idle);
}

#[test]
fn test_thread_context_runs_on_helper() {
    let (c, _) = common::recording_client();
    let tids = Arc::new(Mutex::new(Vec::new()));
    let t = tids.clone();
    c.register_callback(
        move |_: CallbackEvent, _: usize| {
            t.lock().unwrap().push(crest_sys::signal::gettid());
            Verdict::Proceed
        },
        0,
        CallbackContext::Thread,
    )
    .unwrap();

    let me = crest_sys::signal::gettid();
    assert_eq!(
        c.interrupt_line().deliver(Token::new(1)),
        Delivery::Ran(Resume::Continue)
    );
    let seen = tids.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|&tid| tid != me));
    assert_eq!(seen[0], seen[1]);
}

#[test]
fn test_checkpoint_now_runs_remaining_halves_first() {
    let (c, d) = common::recording_client();
    let log: Log = Arc::default();
    let inner = c.clone();
    let l = log.clone();
    c.register_callback(
        move |event: CallbackEvent, _: usize| {
            if event == CallbackEvent::Checkpoint {
                l.lock().unwrap().push("A:ckpt".to_string());
                let r = inner.checkpoint_now(CheckpointFlags::Ready).unwrap();
                l.lock().unwrap().push(format!("A:after:{:?}", r));
                // Asking again reports the same outcome.
                assert_eq!(inner.checkpoint_now(CheckpointFlags::Ready).unwrap(), r);
            }
            Verdict::Proceed
        },
        0,
        CallbackContext::Signal,
    )
    .unwrap();
    c.register_callback(logger(log.clone(), "B", Verdict::Proceed), 0, CallbackContext::Signal)
        .unwrap();

    c.interrupt_line().deliver(Token::new(6));
    assert_eq!(
        entries(&log),
        ["A:ckpt", "B:ckpt", "A:after:Continue", "B:cont"]
    );
    let captures = d
        .seen()
        .into_iter()
        .filter(|s| matches!(s, Seen::Capture(_)))
        .count();
    assert_eq!(captures, 1);
}

#[test]
fn test_checkpoint_now_with_failure_flags() {
    let (c, d) = common::recording_client();
    let result = Arc::new(Mutex::new(None));
    let inner = c.clone();
    let r = result.clone();
    c.register_callback(
        move |event: CallbackEvent, _: usize| {
            if event == CallbackEvent::Checkpoint {
                *r.lock().unwrap() = Some(inner.checkpoint_now(CheckpointFlags::Omit));
            }
            Verdict::Proceed
        },
        0,
        CallbackContext::Signal,
    )
    .unwrap();

    c.interrupt_line().deliver(Token::new(8));
    assert!(matches!(
        result.lock().unwrap().take(),
        Some(Err(CrestError::Aborted(AbortReason::Omitted)))
    ));
    assert!(d
        .seen()
        .contains(&Seen::Abort(Token::new(8), AbortReason::Omitted)));
    assert!(!d.seen().contains(&Seen::Capture(Token::new(8))));
}

#[test]
fn test_replace_self_takes_effect_next_time() {
    let (c, _) = common::recording_client();
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = c.clone();
    let h = hits.clone();
    let id = c
        .register_callback(
            move |event: CallbackEvent, _: usize| {
                if event == CallbackEvent::Checkpoint {
                    let h2 = h.clone();
                    inner
                        .replace_self(
                            move |_: CallbackEvent, arg: usize| {
                                h2.fetch_add(arg, Ordering::SeqCst);
                                Verdict::Proceed
                            },
                            100,
                            CallbackContext::Signal,
                        )
                        .unwrap();
                }
                Verdict::Proceed
            },
            0,
            CallbackContext::Signal,
        )
        .unwrap();
    assert_eq!(id.index(), 0);

    c.interrupt_line().deliver(Token::new(1));
    assert_eq!(hits.load(Ordering::SeqCst), 100);
    c.interrupt_line().deliver(Token::new(2));
    assert_eq!(hits.load(Ordering::SeqCst), 300);
}

#[test]
fn test_in_callback_restrictions() {
    let (c, _) = common::recording_client();
    let noop = |_: CallbackEvent, _: usize| Verdict::Proceed;
    let other = c.register_callback(noop, 0, CallbackContext::Signal).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let inner = c.clone();
    let e = errors.clone();
    c.register_callback(
        move |event: CallbackEvent, _: usize| {
            if event == CallbackEvent::Checkpoint {
                let mut e = e.lock().unwrap();
                e.push(inner.register_callback(noop, 0, CallbackContext::Signal).err());
                e.push(
                    inner
                        .replace_callback(other, noop, 0, CallbackContext::Signal)
                        .err(),
                );
                e.push(inner.replace_self(noop, 0, CallbackContext::Thread).err());
                // Sections are free for the running thread.
                inner.enter_critical().unwrap();
                inner.leave_critical().unwrap();
            }
            Verdict::Proceed
        },
        0,
        CallbackContext::Signal,
    )
    .unwrap();

    c.interrupt_line().deliver(Token::new(1));
    let errors = errors.lock().unwrap();
    assert!(matches!(errors[0], Some(CrestError::Busy)));
    assert!(matches!(errors[1], Some(CrestError::InvalidArgument(_))));
    assert!(matches!(errors[2], Some(CrestError::InvalidArgument(_))));
}

#[test]
fn test_info_and_forward_inside_callback() {
    let (c, d) = common::recording_client();
    let info = Arc::new(Mutex::new(None));
    let inner = c.clone();
    let i = info.clone();
    c.register_callback(
        move |event: CallbackEvent, _: usize| {
            if event == CallbackEvent::Checkpoint {
                *i.lock().unwrap() = Some(inner.checkpoint_info().unwrap());
                inner.forward(Scope::Tree, None).unwrap();
                assert!(inner.restart_info().is_ok());
            }
            Verdict::Proceed
        },
        0,
        CallbackContext::Thread,
    )
    .unwrap();

    c.interrupt_line().deliver(Token::new(3));
    let info = info.lock().unwrap().clone().unwrap();
    assert_eq!(info.scope, Scope::Process);
    assert_eq!(info.target, crest_sys::signal::getpid());
    assert!(d.seen().contains(&Seen::Forward(
        Token::new(3),
        Scope::Tree,
        crest_sys::signal::getpid()
    )));
}

static HOOK_HITS: AtomicI32 = AtomicI32::new(0);

fn count_hook(event: HookEvent) {
    HOOK_HITS.fetch_add(1 << (event as i32 * 4), Ordering::SeqCst);
}

#[test]
fn test_hooks_follow_registry_contents() {
    let (c, _) = common::recording_client();
    for slot in 0..crest::NUM_HOOKS as i32 {
        c.register_hook(slot, Hook::Run(count_hook)).unwrap();
    }
    let nibble = |e: HookEvent| (HOOK_HITS.load(Ordering::SeqCst) >> (e as i32 * 4)) & 0xf;

    c.interrupt_line().deliver(Token::new(1));
    assert_eq!(nibble(HookEvent::ContinueNoCallbacks), 1);
    assert_eq!(nibble(HookEvent::ContinueSignalContext), 0);

    c.register_callback(|_: CallbackEvent, _: usize| Verdict::Proceed, 0, CallbackContext::Signal)
        .unwrap();
    c.interrupt_line().deliver(Token::new(2));
    assert_eq!(nibble(HookEvent::ContinueSignalContext), 1);
    assert_eq!(nibble(HookEvent::ContinueThreadContext), 0);

    c.register_callback(|_: CallbackEvent, _: usize| Verdict::Proceed, 0, CallbackContext::Thread)
        .unwrap();
    c.interrupt_line().deliver(Token::new(3));
    assert_eq!(nibble(HookEvent::ContinueSignalContext), 2);
    assert_eq!(nibble(HookEvent::ContinueThreadContext), 1);
    assert_eq!(nibble(HookEvent::ContinueNoCallbacks), 1);
}

#[test]
fn test_table_capacity() {
    common::init_logger();
    let c = Client::builder()
        .config(crest::Config::default().with_max_callbacks(1))
        .dumper(common::RecordingDumper::new())
        .build();
    c.initialize().unwrap();
    let noop = |_: CallbackEvent, _: usize| Verdict::Proceed;
    c.register_callback(noop, 0, CallbackContext::Signal).unwrap();
    assert!(matches!(
        c.register_callback(noop, 0, CallbackContext::Signal),
        Err(CrestError::NoSpace(1))
    ));
}
