// Copyright (c) 2025 Mainspring Contributors
//
// Process-wide once-per-second timer.
//
// A single background thread drives every registrant. Registrations are
// RAII: dropping the handle deregisters. The timer thread holds only a
// weak reference to the shared state, so it exits on its own once the
// last handle and the last registration are gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const TICK_PERIOD: Duration = Duration::from_secs(1);

type TickFn = Box<dyn Fn() + Send + Sync>;

struct Registrant {
    id: u64,
    tick: TickFn,
}

struct TickerInner {
    registrants: Mutex<Vec<Arc<Registrant>>>,
    next_id: AtomicU64,
}

/// A shared once-per-second timer.
///
/// Callbacks run on the timer thread and must not block; long work
/// belongs on a [`crate::worker::ThreadWorker`].
pub struct Ticker {
    inner: Arc<TickerInner>,
}

/// RAII handle for a ticker registration. Dropping it deregisters.
pub struct TickerRegistration {
    inner: Arc<TickerInner>,
    id: u64,
}

impl Ticker {
    /// Spawns a dedicated timer thread and returns a handle to it.
    pub fn new() -> Self {
        let inner = Arc::new(TickerInner {
            registrants: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("mainspring-ticker".into())
            .spawn(move || run(weak))
            .expect("failed to spawn ticker thread");

        Self { inner }
    }

    /// The process-wide shared ticker.
    pub fn global() -> &'static Ticker {
        static GLOBAL: Lazy<Ticker> = Lazy::new(Ticker::new);
        &GLOBAL
    }

    /// Registers `tick` to run once per second until the returned
    /// handle is dropped.
    pub fn register<F>(&self, tick: F) -> TickerRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registrants.lock().push(Arc::new(Registrant {
            id,
            tick: Box::new(tick),
        }));
        tracing::debug!(id, "ticker registration added");

        TickerRegistration {
            inner: Arc::clone(&self.inner),
            id,
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TickerRegistration {
    fn drop(&mut self) {
        self.inner.registrants.lock().retain(|r| r.id != self.id);
        tracing::debug!(id = self.id, "ticker registration removed");
    }
}

fn run(weak: Weak<TickerInner>) {
    loop {
        thread::sleep(TICK_PERIOD);

        let Some(inner) = weak.upgrade() else {
            return;
        };

        // Snapshot under the lock, invoke outside it, so a callback may
        // register or deregister without deadlocking.
        let snapshot: Vec<Arc<Registrant>> = inner.registrants.lock().iter().cloned().collect();
        drop(inner);

        for registrant in snapshot {
            (registrant.tick)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_registration_fires_and_stops() {
        let ticker = Ticker::new();
        let count = Arc::new(AtomicUsize::new(0));

        let registration = {
            let count = Arc::clone(&count);
            ticker.register(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Generous bound: the first tick arrives within ~1s.
        let mut fired = false;
        for _ in 0..40 {
            if count.load(Ordering::SeqCst) > 0 {
                fired = true;
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        assert!(fired, "registered callback never fired");

        drop(registration);
        let settled = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2500));
        // At most one in-flight tick may land after deregistration.
        assert!(count.load(Ordering::SeqCst) <= settled + 1);
    }
}
