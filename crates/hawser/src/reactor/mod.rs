//! The two executor roles driving all I/O.
//!
//! An [`IoThread`] is one OS thread running a `mio::Poll` loop with a
//! waker-driven task queue, a deadline heap for timers, and a token→handler
//! dispatch table. The client and server each own a single control thread
//! (registry mutations, resolve dispatch, accepts, reconnect timers, user
//! notifications) plus a [`TransferPool`] of transfer threads (socket
//! reads/writes and assembler invocation). A connection is pinned to one
//! transfer thread for its whole life, which is what serializes all access
//! to its socket, send queue and parser.

use std::{
    collections::{BinaryHeap, HashMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Instant,
};

use mio::{Events, Poll, Registry, Token, Waker, event::Event};
use tracing::{debug, error};

mod pool;
pub(crate) use pool::TransferPool;

const WAKER: Token = Token(usize::MAX);

pub(crate) type Task = Box<dyn FnOnce(&mut IoCtx<'_>) + Send>;
pub(crate) type EventHandler = Box<dyn FnMut(&mut IoCtx<'_>, &Event) -> HandlerOutcome + Send>;

/// What a readiness handler wants done with its dispatch entry afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Keep,
    Detach,
}

/// Lock a mutex, recovering the guard if a caught panic poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Loop-local state handed to tasks, timers and readiness handlers.
pub(crate) struct IoCtx<'a> {
    pub registry: &'a Registry,
    handlers: &'a mut HashMap<Token, EventHandler>,
    timers: &'a mut BinaryHeap<TimerEntry>,
    timer_seq: &'a mut u64,
}

impl IoCtx<'_> {
    pub fn set_handler(&mut self, token: Token, handler: EventHandler) {
        self.handlers.insert(token, handler);
    }

    pub fn remove_handler(&mut self, token: Token) {
        self.handlers.remove(&token);
    }

    /// Runs `task` on this thread once `at` has passed.
    pub fn schedule(&mut self, at: Instant, task: Task) {
        let seq = *self.timer_seq;
        *self.timer_seq += 1;
        self.timers.push(TimerEntry { at, seq, task });
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    task: Task,
}

// BinaryHeap is a max-heap; compare reversed so the earliest deadline pops
// first, with the sequence number breaking ties in submission order.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct IoShared {
    registry: Registry,
    waker: Waker,
    tasks: Mutex<VecDeque<Task>>,
    running: AtomicBool,
    next_token: AtomicUsize,
    thread_id: OnceLock<ThreadId>,
}

/// Cheap cloneable handle for posting work onto an [`IoThread`].
#[derive(Clone)]
pub(crate) struct IoHandle {
    shared: Arc<IoShared>,
}

impl IoHandle {
    /// Enqueues `task` for the loop thread and wakes it. Dropped silently
    /// once the thread has been stopped.
    pub fn post(&self, task: impl FnOnce(&mut IoCtx<'_>) + Send + 'static) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        lock(&self.shared.tasks).push_back(Box::new(task));
        if let Err(err) = self.shared.waker.wake() {
            debug!(?err, "waker failed");
        }
    }

    pub fn alloc_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }
}

/// One thread driving a `mio::Poll` loop until stopped.
pub(crate) struct IoThread {
    handle: IoHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl IoThread {
    pub fn spawn(name: &str) -> Self {
        let poll = Poll::new().expect("couldn't set up a poll for io thread");
        let waker = Waker::new(poll.registry(), WAKER).expect("couldn't set up a waker");
        let registry = poll.registry().try_clone().expect("couldn't clone poll registry");
        let shared = Arc::new(IoShared {
            registry,
            waker,
            tasks: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(0),
            thread_id: OnceLock::new(),
        });
        let loop_shared = shared.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(poll, loop_shared))
            .expect("couldn't spawn io thread");
        Self { handle: IoHandle { shared }, join: Mutex::new(Some(join)) }
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Signals the loop to exit and joins it. Safe to call more than once,
    /// and from within the loop thread itself (in which case the join is
    /// skipped).
    pub fn stop(&self) {
        let shared = &self.handle.shared;
        if shared.running.swap(false, Ordering::AcqRel) {
            if let Err(err) = shared.waker.wake() {
                debug!(?err, "wake on stop");
            }
        }
        if shared.thread_id.get() == Some(&thread::current().id()) {
            return;
        }
        if let Some(join) = lock(&self.join).take() {
            let _ = join.join();
        }
        // Pending tasks may close reference cycles back to their owner.
        lock(&shared.tasks).clear();
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(mut poll: Poll, shared: Arc<IoShared>) {
    let _ = shared.thread_id.set(thread::current().id());
    let mut events = Events::with_capacity(256);
    let mut handlers: HashMap<Token, EventHandler> = HashMap::new();
    let mut timers: BinaryHeap<TimerEntry> = BinaryHeap::new();
    let mut timer_seq: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        let timeout = timers.peek().map(|t| t.at.saturating_duration_since(Instant::now()));
        if let Err(err) = poll.poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(?err, "io thread poll failed");
            break;
        }

        // Tasks run before readiness dispatch so a handler attached right
        // after its source was registered sees that source's first event.
        loop {
            let task = lock(&shared.tasks).pop_front();
            let Some(task) = task else { break };
            let mut ctx = IoCtx {
                registry: poll.registry(),
                handlers: &mut handlers,
                timers: &mut timers,
                timer_seq: &mut timer_seq,
            };
            run_guarded((), || task(&mut ctx));
        }

        loop {
            let now = Instant::now();
            let due = if timers.peek().is_some_and(|t| t.at <= now) { timers.pop() } else { None };
            let Some(entry) = due else { break };
            let mut ctx = IoCtx {
                registry: poll.registry(),
                handlers: &mut handlers,
                timers: &mut timers,
                timer_seq: &mut timer_seq,
            };
            run_guarded((), || (entry.task)(&mut ctx));
        }

        for ev in events.iter() {
            let token = ev.token();
            if token == WAKER {
                continue;
            }
            // Take the handler out for the duration of the call so it can
            // attach or detach other tokens through the ctx.
            let Some(mut handler) = handlers.remove(&token) else {
                debug!(?token, "readiness for unknown token");
                continue;
            };
            let outcome = {
                let mut ctx = IoCtx {
                    registry: poll.registry(),
                    handlers: &mut handlers,
                    timers: &mut timers,
                    timer_seq: &mut timer_seq,
                };
                run_guarded(HandlerOutcome::Keep, || handler(&mut ctx, ev))
            };
            if outcome == HandlerOutcome::Keep {
                handlers.entry(token).or_insert(handler);
            }
        }
    }

    lock(&shared.tasks).clear();
}

/// Runs a user-reachable callback, logging instead of unwinding the loop
/// thread if it panics.
fn run_guarded<R>(default: R, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            error!(msg, "caught panic in io thread callback");
            default
        }
    }
}
