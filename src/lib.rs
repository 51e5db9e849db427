// Mainspring - concurrent runtime primitives
//
// Three facilities make up the core and are designed to work together:
// a paged memory subsystem (page pool + slab allocator), a
// thread-with-mailbox worker, and a cooperative interruption protocol
// shared between the worker and arbitrary wait sites. A once-per-second
// ticker drives the page pool's deferred reclamation.

pub mod concurrent;
pub mod error;
pub mod memory;
pub mod ticker;
pub mod worker;

pub use error::{KernelError, Result};
pub use memory::{PagePool, PagePoolConfig, SlabAllocator};
pub use ticker::Ticker;
pub use worker::{DeferredDeleter, InterruptMode, InterruptToken, ThreadWorker, Worker};
