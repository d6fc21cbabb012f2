//! Shared-memory synchronization layer for the foreman worker pool.
//!
//! Everything here is built on one surface: a fixed [`SharedRegion`] of
//! word-addressable memory with sequentially consistent atomic operations
//! and futex-style wait/wake on 32-bit words. The primitives each occupy a
//! documented number of words inside a region supplied at construction, so
//! an embedder can lay several of them out in a single allocation sized
//! once at startup.
//!
//! Blocking entry points all have `_timeout` variants that surface
//! [`SyncError::TimedOut`]; lock ordering across multiple primitives is the
//! caller's responsibility.

pub mod barrier;
pub mod error;
pub mod mutex;
pub mod queue;
pub mod region;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use barrier::{Barrier, BarrierWaitResult};
pub use error::{SyncError, SyncResult, WaitResult};
pub use mutex::{Mutex, MutexGuard};
pub use queue::BoundedQueue;
pub use region::SharedRegion;
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use spinlock::{SpinGuard, SpinLock};
