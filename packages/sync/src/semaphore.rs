//! Counting semaphore over a single region word of remaining permits.

use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult, WaitResult};
use crate::region::SharedRegion;

/// Counting semaphore. Permits never go negative: `acquire` decrements via
/// CAS only when the count is positive, otherwise parks on the zero value.
pub struct Semaphore {
    region: SharedRegion,
    offset: usize,
}

impl Semaphore {
    /// Words used inside the shared region.
    pub const FOOTPRINT: usize = 4;

    pub fn new(region: SharedRegion, offset: usize, permits: u32) -> SyncResult<Self> {
        region.store32(offset, permits)?;
        Ok(Self { region, offset })
    }

    pub fn acquire(&self) -> SyncResult<SemaphorePermit<'_>> {
        self.acquire_inner(None)
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> SyncResult<SemaphorePermit<'_>> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    pub fn try_acquire(&self) -> SyncResult<Option<SemaphorePermit<'_>>> {
        loop {
            let permits = self.region.load32(self.offset)?;
            if permits == 0 {
                return Ok(None);
            }
            if self
                .region
                .compare_exchange32(self.offset, permits, permits - 1)?
                .is_ok()
            {
                return Ok(Some(SemaphorePermit { semaphore: self }));
            }
        }
    }

    fn acquire_inner(&self, deadline: Option<Instant>) -> SyncResult<SemaphorePermit<'_>> {
        loop {
            if let Some(permit) = self.try_acquire()? {
                return Ok(permit);
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(SyncError::TimedOut {
                            offset: self.offset,
                        });
                    }
                    Some(left)
                }
            };
            if self.region.wait32(self.offset, 0, remaining)? == WaitResult::TimedOut {
                return Err(SyncError::TimedOut {
                    offset: self.offset,
                });
            }
        }
    }

    /// Return one permit and wake a parked acquirer.
    pub fn release(&self) -> SyncResult<()> {
        self.region.fetch_add32(self.offset, 1)?;
        self.region.wake(self.offset, 1)?;
        Ok(())
    }

    pub fn available_permits(&self) -> SyncResult<u32> {
        self.region.load32(self.offset)
    }
}

/// RAII permit; releases on drop.
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Keep the permit past the guard's lifetime; the caller becomes
    /// responsible for a matching [`Semaphore::release`].
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        let _ = self.semaphore.release();
    }
}
