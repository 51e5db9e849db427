// Copyright (c) 2025 Mainspring Contributors
//
// A Worker is a named FIFO mailbox of deferred calls with an
// open/closed lifecycle. Any number of threads enqueue; exactly one
// thread drains. A call that panics is confined and logged, so one bad
// call does not take the worker down.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{KernelError, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;
type SignalFn = Box<dyn Fn() + Send + Sync + 'static>;

struct Mailbox {
    queue: VecDeque<Job>,
    closed: bool,
}

/// FIFO mailbox of deferred calls.
///
/// Enqueue order is the linearization order of [`Worker::call`]; calls
/// enqueued by one thread run in that thread's enqueue order. Enqueuing
/// never blocks behind a running call.
pub struct Worker {
    name: String,
    mailbox: Mutex<Mailbox>,
    /// Fires on an empty-to-non-empty transition; wired once by the
    /// owning ThreadWorker to wake its wait.
    signal: OnceCell<SignalFn>,
}

impl Worker {
    /// A new, open worker with an empty mailbox.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                closed: false,
            }),
            signal: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a deferred call. Arguments are bound by closure
    /// capture. Fails once the worker is closed.
    pub fn call<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(f))
    }

    fn push(&self, job: Job) -> Result<()> {
        let was_empty;
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.closed {
                return Err(KernelError::Closed {
                    name: self.name.clone(),
                });
            }
            was_empty = mailbox.queue.is_empty();
            mailbox.queue.push_back(job);
        }
        if was_empty {
            self.raise_signal();
        }
        Ok(())
    }

    /// Enqueues `job` and closes the mailbox in one step. A no-op when
    /// already closed. Used by the stop path so nothing can slip in
    /// between the stop call and the close.
    pub(crate) fn push_and_close(&self, job: Job) {
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.closed {
                return;
            }
            mailbox.queue.push_back(job);
            mailbox.closed = true;
        }
        self.raise_signal();
    }

    /// Drains the mailbox in FIFO order on the calling thread, running
    /// each call. Returns when the mailbox is empty. Must be driven by
    /// a single consumer thread.
    pub fn process(&self) {
        loop {
            let job = self.mailbox.lock().queue.pop_front();
            let Some(job) = job else {
                return;
            };
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(worker = %self.name, "deferred call panicked");
            }
        }
    }

    /// Closes the mailbox; subsequent calls fail. Idempotent.
    pub fn close(&self) {
        self.mailbox.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.lock().closed
    }

    /// Number of calls waiting to run.
    pub fn pending(&self) -> usize {
        self.mailbox.lock().queue.len()
    }

    pub(crate) fn set_signal(&self, signal: SignalFn) {
        let _ = self.signal.set(signal);
    }

    fn raise_signal(&self) {
        if let Some(signal) = self.signal.get() {
            signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fifo_drain() {
        let worker = Worker::new("fifo");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            worker.call(move || seen.lock().push(i)).unwrap();
        }
        assert_eq!(worker.pending(), 10);

        worker.process();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn test_closed_rejects_calls() {
        let worker = Worker::new("closing");
        worker.call(|| {}).unwrap();
        worker.close();
        worker.close();

        match worker.call(|| {}) {
            Err(KernelError::Closed { name }) => assert_eq!(name, "closing"),
            other => panic!("expected Closed, got {other:?}"),
        }

        // Close does not drop what was already queued.
        assert_eq!(worker.pending(), 1);
        worker.process();
    }

    #[test]
    fn test_panicking_call_is_confined() {
        let worker = Worker::new("confined");
        let ran = Arc::new(AtomicUsize::new(0));

        worker.call(|| panic!("bad call")).unwrap();
        {
            let ran = Arc::clone(&ran);
            worker.call(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        }
        .unwrap();

        worker.process();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_fires_on_empty_transition() {
        let worker = Worker::new("signaled");
        let signals = Arc::new(AtomicUsize::new(0));
        {
            let signals = Arc::clone(&signals);
            worker.set_signal(Box::new(move || {
                signals.fetch_add(1, Ordering::SeqCst);
            }));
        }

        worker.call(|| {}).unwrap();
        worker.call(|| {}).unwrap();
        assert_eq!(signals.load(Ordering::SeqCst), 1);

        worker.process();
        worker.call(|| {}).unwrap();
        assert_eq!(signals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_push_and_close_is_atomic() {
        let worker = Worker::new("stopper");
        worker.push_and_close(Box::new(|| {}));
        assert!(worker.is_closed());
        assert_eq!(worker.pending(), 1);

        // Second stop is a no-op.
        worker.push_and_close(Box::new(|| {}));
        assert_eq!(worker.pending(), 1);
    }
}
