// Copyright (c) 2025 Mainspring Contributors
//
// Cooperative interruption between a worker thread and arbitrary
// interruptors.
//
// One atomic word holds the protocol state; every transition is a
// compare-and-swap:
//
//   Run       --wait (owner)-------> Wait       owner parks on the condvar
//   Run       --interrupt (other)--> Interrupt  latched for the next poll
//   Wait      --interrupt (other)--> Run        interruptor also notifies
//   Wait      --timeout (owner)----> Run        nothing observed
//   Interrupt --poll (owner)-------> Run        observed and consumed
//   Interrupt --wait (owner)-------> Run        wait reports "interrupted"
//                                               immediately, no park
//
// `Return` is reserved by the protocol (waiting from it proceeds to
// Wait, interrupting in it is a no-op); no live transition enters it.
// Polling from Wait or Return is a contract violation and fatal.

use std::panic::resume_unwind;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

const RUN: u8 = 0;
const INTERRUPT: u8 = 1;
const WAIT: u8 = 2;
const RETURN: u8 = 3;

/// Control-flow signal raised by the [`InterruptMode::Raising`]
/// strategy. Never escapes the worker run loop.
#[derive(Debug)]
pub struct Interrupted;

/// How a positive interruption observation is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// `interruption_point` and `wait` return booleans; the caller is
    /// expected to check them.
    Polling,
    /// A positive observation raises [`Interrupted`] (as a panic
    /// payload) which the run loop catches and consumes.
    Raising,
}

pub(crate) struct InterruptState {
    state: AtomicU8,
    lock: Mutex<()>,
    wake: Condvar,
}

impl InterruptState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RUN),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn try_change(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attempts the transition into the wait state. Returns true when a
    /// latched interruption makes the caller run instead.
    fn begin_wait(&self) -> bool {
        loop {
            assert!(
                self.state.load(Ordering::Acquire) != WAIT,
                "concurrent wait on one interrupt state"
            );
            if self.try_change(INTERRUPT, RUN) {
                return true;
            }
            if self.try_change(RUN, WAIT) || self.try_change(RETURN, WAIT) {
                return false;
            }
        }
    }

    /// The owner woke without being notified.
    fn end_wait_timeout(&self) -> bool {
        // A failed swing back to Run means an interruptor got in
        // between the timeout and now; count it as interrupted.
        !self.try_change(WAIT, RUN)
    }

    /// Blocks until interrupted or `timeout` elapses. Returns true when
    /// interrupted. Owner-side only.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.begin_wait() {
            return true;
        }
        let timed_out = self.wake.wait_for(&mut guard, timeout).timed_out();
        drop(guard);

        if timed_out {
            self.end_wait_timeout()
        } else {
            // Only an interruptor notifies, and it has already moved
            // the state back to Run.
            true
        }
    }

    /// Interrupts the owner: latches if it is running, wakes it if it
    /// is waiting. Any thread may call this.
    pub(crate) fn interrupt(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                INTERRUPT | RETURN => return,
                RUN => {
                    if self.try_change(RUN, INTERRUPT) {
                        return;
                    }
                }
                WAIT => {
                    if self.try_change(WAIT, RUN) {
                        // Taking the lock orders this notify after the
                        // owner has parked, so the wakeup cannot be
                        // lost between its state publish and its park.
                        let _guard = self.lock.lock();
                        self.wake.notify_one();
                        return;
                    }
                }
                _ => unreachable!("corrupt interrupt state"),
            }
        }
    }

    /// Consumes a latched interruption. Owner-side only.
    pub(crate) fn consume(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        assert!(
            state != WAIT && state != RETURN,
            "interruption_point while waiting"
        );
        self.try_change(INTERRUPT, RUN)
    }
}

/// Handle to a worker's interruption protocol.
///
/// Cloneable and sendable; the worker thread polls and waits through
/// it, any other thread may [`InterruptToken::interrupt`] through it.
#[derive(Clone)]
pub struct InterruptToken {
    state: Arc<InterruptState>,
    mode: InterruptMode,
}

impl InterruptToken {
    pub(crate) fn new(state: Arc<InterruptState>, mode: InterruptMode) -> Self {
        Self { state, mode }
    }

    /// Observes and consumes a pending interruption.
    ///
    /// Under [`InterruptMode::Polling`] returns true when interrupted;
    /// under [`InterruptMode::Raising`] a positive observation raises
    /// [`Interrupted`] instead of returning. Must be called from the
    /// worker thread; calling it while the state is parked is fatal.
    pub fn interruption_point(&self) -> bool {
        let interrupted = self.state.consume();
        if interrupted && self.mode == InterruptMode::Raising {
            // Unwind without the panic hook: this is control flow, not
            // a failure.
            resume_unwind(Box::new(Interrupted));
        }
        interrupted
    }

    /// Interruptible sleep for idle functions: returns true (or raises
    /// under [`InterruptMode::Raising`]) as soon as the token is
    /// interrupted, false when `timeout` elapses quietly.
    pub fn wait(&self, timeout: Duration) -> bool {
        let interrupted = self.state.wait(timeout);
        if interrupted && self.mode == InterruptMode::Raising {
            resume_unwind(Box::new(Interrupted));
        }
        interrupted
    }

    /// Requests an interruption from any thread.
    pub fn interrupt(&self) {
        self.state.interrupt();
    }

    pub fn mode(&self) -> InterruptMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_interrupt_then_wait_returns_immediately() {
        let state = InterruptState::new();
        state.interrupt();

        let start = Instant::now();
        assert!(state.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));

        // Consumed: the next timed wait parks and times out.
        assert!(!state.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_timeout_is_not_an_interruption() {
        let state = InterruptState::new();
        assert!(!state.wait(Duration::from_millis(20)));
        assert!(!state.consume());
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let state = Arc::new(InterruptState::new());
        let interruptor = Arc::clone(&state);

        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let interrupted = state.wait(Duration::from_secs(30));
            (interrupted, start.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        interruptor.interrupt();

        let (interrupted, elapsed) = waiter.join().unwrap();
        assert!(interrupted);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupt_latches_once() {
        let state = InterruptState::new();
        state.interrupt();
        state.interrupt();
        assert!(state.consume());
        assert!(!state.consume());
    }

    #[test]
    fn test_polling_token_reports() {
        let state = Arc::new(InterruptState::new());
        let token = InterruptToken::new(Arc::clone(&state), InterruptMode::Polling);

        assert!(!token.interruption_point());
        token.interrupt();
        assert!(token.interruption_point());
        assert!(!token.interruption_point());
    }

    #[test]
    fn test_raising_token_raises() {
        let state = Arc::new(InterruptState::new());
        let token = InterruptToken::new(Arc::clone(&state), InterruptMode::Raising);
        token.interrupt();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            token.interruption_point();
        }));
        let payload = outcome.expect_err("interruption must raise");
        assert!(payload.is::<Interrupted>());

        // Raising consumed the latch.
        assert!(!token.interruption_point());
    }

    #[test]
    #[should_panic(expected = "interruption_point while waiting")]
    fn test_polling_while_parked_is_fatal() {
        let state = InterruptState::new();
        state.state.store(WAIT, Ordering::SeqCst);
        state.consume();
    }
}
