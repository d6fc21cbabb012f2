//! Busy-waiting lock for provably short critical sections.

use std::hint;

use crate::error::SyncResult;
use crate::region::SharedRegion;

const FREE: u32 = 0;
const HELD: u32 = 1;

/// One-word spinlock. `lock` spins on CAS 0→1, `unlock` stores 0.
///
/// Fairness is not guaranteed; use [`crate::Mutex`] for sections that may
/// block for more than a handful of instructions.
pub struct SpinLock {
    region: SharedRegion,
    offset: usize,
}

impl SpinLock {
    /// Words used inside the shared region.
    pub const FOOTPRINT: usize = 4;

    pub fn new(region: SharedRegion, offset: usize) -> SyncResult<Self> {
        region.load32(offset)?;
        Ok(Self { region, offset })
    }

    pub fn lock(&self) -> SyncResult<SpinGuard<'_>> {
        loop {
            if self
                .region
                .compare_exchange32(self.offset, FREE, HELD)?
                .is_ok()
            {
                return Ok(SpinGuard { lock: self });
            }
            while self.region.load32(self.offset)? == HELD {
                hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> SyncResult<Option<SpinGuard<'_>>> {
        Ok(self
            .region
            .compare_exchange32(self.offset, FREE, HELD)?
            .ok()
            .map(|_| SpinGuard { lock: self }))
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        // Offset was validated at construction; the store cannot fail.
        let _ = self.lock.region.store32(self.lock.offset, FREE);
    }
}
