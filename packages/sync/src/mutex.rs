//! Blocking mutual exclusion over a single region word.

use std::time::Duration;

use crate::error::{SyncError, SyncResult, WaitResult};
use crate::region::SharedRegion;

const FREE: u32 = 0;
const LOCKED: u32 = 1;
const POISONED: u32 = 2;

/// One-word mutex with poisoning.
///
/// `lock` CASes 0→1 and parks on the word when contended; `unlock` (guard
/// drop) stores 0 and wakes one waiter. A holder that panics marks the word
/// poisoned on unwind, and every later `lock` fails with
/// [`SyncError::Poisoned`] instead of hanging on state the dead holder may
/// have left inconsistent.
pub struct Mutex {
    region: SharedRegion,
    offset: usize,
}

impl Mutex {
    /// Words used inside the shared region.
    pub const FOOTPRINT: usize = 4;

    pub fn new(region: SharedRegion, offset: usize) -> SyncResult<Self> {
        region.load32(offset)?;
        Ok(Self { region, offset })
    }

    pub fn lock(&self) -> SyncResult<MutexGuard<'_>> {
        self.lock_inner(None)
    }

    /// As [`lock`](Self::lock), surfacing [`SyncError::TimedOut`] if the
    /// lock cannot be acquired within `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> SyncResult<MutexGuard<'_>> {
        self.lock_inner(Some(timeout))
    }

    pub fn try_lock(&self) -> SyncResult<Option<MutexGuard<'_>>> {
        match self.region.compare_exchange32(self.offset, FREE, LOCKED)? {
            Ok(_) => Ok(Some(MutexGuard { lock: self })),
            Err(POISONED) => Err(SyncError::Poisoned {
                offset: self.offset,
            }),
            Err(_) => Ok(None),
        }
    }

    fn lock_inner(&self, timeout: Option<Duration>) -> SyncResult<MutexGuard<'_>> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            match self.region.compare_exchange32(self.offset, FREE, LOCKED)? {
                Ok(_) => return Ok(MutexGuard { lock: self }),
                Err(POISONED) => {
                    return Err(SyncError::Poisoned {
                        offset: self.offset,
                    });
                }
                Err(observed) => {
                    let remaining = match deadline {
                        None => None,
                        Some(d) => {
                            let left = d.saturating_duration_since(std::time::Instant::now());
                            if left.is_zero() {
                                return Err(SyncError::TimedOut {
                                    offset: self.offset,
                                });
                            }
                            Some(left)
                        }
                    };
                    if self.region.wait32(self.offset, observed, remaining)?
                        == WaitResult::TimedOut
                    {
                        return Err(SyncError::TimedOut {
                            offset: self.offset,
                        });
                    }
                }
            }
        }
    }
}

pub struct MutexGuard<'a> {
    lock: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let region = &self.lock.region;
        let offset = self.lock.offset;
        if std::thread::panicking() {
            let _ = region.store32(offset, POISONED);
            let _ = region.wake(offset, usize::MAX);
        } else {
            let _ = region.store32(offset, FREE);
            let _ = region.wake(offset, 1);
        }
    }
}
