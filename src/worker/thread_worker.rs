// Copyright (c) 2025 Mainspring Contributors
//
// Binds a Worker to a dedicated background thread plus a user idle
// function, arbitrating between mailbox drains, idle work, and parking
// on the interruption protocol.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Result;
use crate::worker::interrupt::{InterruptMode, InterruptState, InterruptToken, Interrupted};
use crate::worker::mailbox::Worker;

/// Idle passes that observe nothing park for this long. The timeout
/// only bounds lost-wakeup exposure; wakeups normally arrive through
/// the interruption protocol.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// User work performed between mailbox drains. Returning true means
/// "I was interrupted, re-enter the loop now".
pub type IdleFn = Box<dyn FnMut() -> bool + Send + 'static>;
/// One-shot hook run on the worker thread at startup or shutdown.
pub type HookFn = Box<dyn FnOnce() + Send + 'static>;

/// A [`Worker`] serviced by its own named background thread.
///
/// The run loop drains the mailbox, runs the idle function, and parks
/// on the interruption protocol until new work or an interruption
/// arrives. Dropping the worker stops it and joins the thread.
pub struct ThreadWorker {
    name: String,
    worker: Arc<Worker>,
    state: Arc<InterruptState>,
    mode: InterruptMode,
    should_stop: Arc<AtomicBool>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceCell<ThreadId>,
}

impl ThreadWorker {
    /// Constructs the worker and its interruption state; no thread runs
    /// until [`ThreadWorker::start`].
    pub fn new(name: impl Into<String>, mode: InterruptMode) -> Self {
        let name = name.into();
        let worker = Arc::new(Worker::new(name.clone()));
        let state = Arc::new(InterruptState::new());

        // New work must wake the idle loop: route the mailbox signal
        // into the interruption protocol.
        {
            let state = Arc::clone(&state);
            worker.set_signal(Box::new(move || state.interrupt()));
        }

        Self {
            name,
            worker,
            state,
            mode,
            should_stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            thread: Mutex::new(None),
            thread_id: OnceCell::new(),
        }
    }

    /// Spawns the worker thread. `idle` runs between mailbox drains
    /// (default: report "not interrupted"); `init` and `exit` run once
    /// on the worker thread. Calling `start` twice is fatal.
    pub fn start(&self, idle: Option<IdleFn>, init: Option<HookFn>, exit: Option<HookFn>) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "start() called twice on worker '{}'",
            self.name
        );

        let name = self.name.clone();
        let worker = Arc::clone(&self.worker);
        let token = self.token();
        let should_stop = Arc::clone(&self.should_stop);

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(name, worker, token, should_stop, idle, init, exit))
            .expect("failed to spawn worker thread");

        let _ = self.thread_id.set(handle.thread().id());
        *self.thread.lock() = Some(handle);
    }

    /// Requests the worker to stop: queues the internal stop call and
    /// closes the mailbox, so every call enqueued before this runs and
    /// later calls fail. With `wait` the worker thread is joined.
    ///
    /// Safe to call repeatedly. Calling before `start`, or with
    /// `wait = true` from the worker's own thread, is fatal.
    pub fn stop(&self, wait: bool) {
        assert!(
            self.started.load(Ordering::Acquire),
            "stop() called before start() on worker '{}'",
            self.name
        );
        if wait {
            assert!(
                !self.is_worker_thread(),
                "stop(wait = true) called from worker thread '{}'",
                self.name
            );
        }

        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            let should_stop = Arc::clone(&self.should_stop);
            self.worker
                .push_and_close(Box::new(move || should_stop.store(true, Ordering::Release)));
        }

        if wait {
            // Joins are serialized on the handle lock so every waiter
            // returns only after the thread has terminated.
            let mut handle = self.thread.lock();
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    tracing::error!(worker = %self.name, "worker thread terminated by panic");
                }
            }
        }
    }

    /// Sugar: [`ThreadWorker::stop`] without waiting.
    pub fn stop_request(&self) {
        self.stop(false);
    }

    /// Sugar: [`ThreadWorker::stop`] and join.
    pub fn stop_and_wait(&self) {
        self.stop(true);
    }

    /// Interrupts the idle function by queueing a call that does
    /// nothing. A no-op once the worker is stopped.
    pub fn interrupt(&self) {
        let _ = self.worker.call(|| {});
    }

    /// Enqueues a deferred call on the worker's mailbox.
    pub fn call<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.call(f)
    }

    /// The interruption handle idle functions should poll and wait on.
    pub fn token(&self) -> InterruptToken {
        InterruptToken::new(Arc::clone(&self.state), self.mode)
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_worker_thread(&self) -> bool {
        self.thread_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        // Joining from the worker's own thread would deadlock; a drop
        // there can only request the stop.
        self.stop(!self.is_worker_thread());
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    name: String,
    worker: Arc<Worker>,
    token: InterruptToken,
    should_stop: Arc<AtomicBool>,
    idle: Option<IdleFn>,
    init: Option<HookFn>,
    exit: Option<HookFn>,
) {
    tracing::debug!(worker = %name, "worker thread running");
    if let Some(init) = init {
        init();
    }

    let mut idle = idle.unwrap_or_else(|| Box::new(|| false));

    loop {
        worker.process();

        if should_stop.load(Ordering::Acquire) {
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut interrupted = idle();
            if !interrupted {
                interrupted = token.interruption_point();
            }
            if !interrupted {
                token.wait(IDLE_WAIT);
            }
        }));

        if let Err(payload) = outcome {
            if payload.is::<Interrupted>() {
                // A raised interruption; consumed, loop again.
                continue;
            }
            tracing::error!(worker = %name, "idle function panicked");
        }
    }

    if let Some(exit) = exit {
        exit();
    }
    tracing::debug!(worker = %name, "worker thread exiting");
}
