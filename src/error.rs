use thiserror::Error;

/// Errors surfaced by the runtime kernel.
///
/// Contract violations (double `start`, waiting for a worker from its
/// own thread, polling an interruption point while waiting) are not
/// represented here: they are programming errors and panic.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("allocation of {requested} bytes exceeds the {available} usable bytes per page")]
    RequestTooLarge { requested: usize, available: usize },

    #[error("page pool exhausted: hard cap of {limit} pages reached")]
    Exhausted { limit: usize },

    #[error("system allocator refused a request for {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("worker '{name}' is closed")]
    Closed { name: String },
}

pub type Result<T> = std::result::Result<T, KernelError>;
