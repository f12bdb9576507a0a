use crate::os::ThreadId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public engine operations. Emission-internal
/// failures (out of slab space) are resolved by allocating a fresh slab and
/// never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ic_entries must be within 2..=32, got {0}")]
    InvalidIcEntries(u32),

    #[error("no executable memory satisfies the displacement bound near {near:#x}")]
    NearAllocExhausted { near: usize },

    #[error("mmap failed: {0}")]
    MemoryMap(std::io::Error),

    #[error("mprotect failed: {0}")]
    MemoryProtect(std::io::Error),

    #[error("guest page at {0:#x} is not readable")]
    GuestUnreadable(usize),

    #[error("thread {0:?} is not followed")]
    NotFollowed(ThreadId),

    #[error("operation requires a ThreadControl implementation")]
    Unsupported,
}
