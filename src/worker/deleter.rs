// Copyright (c) 2025 Mainspring Contributors
//
// Background destruction service: hands values to a resident worker so
// teardown cost leaves latency-sensitive threads.

use once_cell::sync::Lazy;

use crate::worker::interrupt::InterruptMode;
use crate::worker::thread_worker::ThreadWorker;

/// Drops values on a dedicated background thread.
///
/// Useful when destruction is expensive (deep structures, deallocation
/// storms) and the current thread should not pay for it. Values handed
/// over from the deleter's own thread, or after it stopped, are dropped
/// inline instead.
pub struct DeferredDeleter {
    worker: ThreadWorker,
}

impl DeferredDeleter {
    pub fn new() -> Self {
        let worker = ThreadWorker::new("mainspring-deleter", InterruptMode::Polling);
        worker.start(None, None, None);
        Self { worker }
    }

    /// The process-wide shared deleter.
    pub fn global() -> &'static DeferredDeleter {
        static GLOBAL: Lazy<DeferredDeleter> = Lazy::new(DeferredDeleter::new);
        &GLOBAL
    }

    /// Queues `value` for destruction on the deleter thread.
    pub fn defer<T: Send + 'static>(&self, value: T) {
        if self.worker.is_worker_thread() {
            // Already on the deleter thread; a round-trip buys nothing.
            drop(value);
            return;
        }
        // On a closed mailbox the rejected closure drops right here,
        // value and all, which is exactly the fallback we want.
        let _ = self.worker.call(move || drop(value));
    }
}

impl Default for DeferredDeleter {
    fn default() -> Self {
        Self::new()
    }
}
