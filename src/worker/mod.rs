// Copyright (c) 2025 Mainspring Contributors
//
// Mailbox workers and the cooperative interruption protocol that
// drives them.

pub mod deleter;
pub mod interrupt;
pub mod mailbox;
pub mod thread_worker;

pub use deleter::DeferredDeleter;
pub use interrupt::{InterruptMode, InterruptToken, Interrupted};
pub use mailbox::Worker;
pub use thread_worker::{HookFn, IdleFn, ThreadWorker};
