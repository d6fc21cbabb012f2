use thiserror::Error;

/// Errors surfaced by region accesses and primitive operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("address {offset:#x} is misaligned for a {width}-bit access")]
    InvalidAddress { offset: usize, width: u32 },

    #[error("access at {offset:#x}+{len} is outside the {region_len}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("timed out waiting on word {offset:#x}")]
    TimedOut { offset: usize },

    #[error("lock at {offset:#x} was poisoned by a failed holder")]
    Poisoned { offset: usize },

    #[error("queue is full")]
    Full,
}

/// Outcome of a futex-style wait on a region word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A waker released this thread (or the wait raced with a wake).
    Woken,
    /// The word no longer held the expected value; the caller should re-check.
    NotEqual,
    /// The timeout elapsed with no wake.
    TimedOut,
}

pub type SyncResult<T> = Result<T, SyncError>;
