//! Reader-writer lock with writer preference.

use crate::error::SyncResult;
use crate::region::SharedRegion;

/// `-1` in the i32 reading of the state word.
const WRITER: u32 = u32::MAX;

/// Two-word read-write lock.
///
/// The `state` word's sign encodes ownership: positive is the reader count,
/// `-1` a writer, `0` free. The second word counts waiting writers; while it
/// is non-zero new readers park instead of incrementing the count, so a
/// stream of readers cannot starve a writer.
pub struct RwLock {
    region: SharedRegion,
    state_offset: usize,
    writers_waiting_offset: usize,
}

impl RwLock {
    /// Words used inside the shared region.
    pub const FOOTPRINT: usize = 8;

    pub fn new(region: SharedRegion, offset: usize) -> SyncResult<Self> {
        region.load32(offset)?;
        region.load32(offset + 4)?;
        Ok(Self {
            region,
            state_offset: offset,
            writers_waiting_offset: offset + 4,
        })
    }

    pub fn read(&self) -> SyncResult<ReadGuard<'_>> {
        loop {
            // Writer preference: hold back while any writer is queued.
            let queued = self.region.load32(self.writers_waiting_offset)?;
            if queued != 0 {
                self.region
                    .wait32(self.writers_waiting_offset, queued, None)?;
                continue;
            }

            let state = self.region.load32(self.state_offset)?;
            if (state as i32) < 0 {
                self.region.wait32(self.state_offset, state, None)?;
                continue;
            }
            if self
                .region
                .compare_exchange32(self.state_offset, state, state + 1)?
                .is_ok()
            {
                return Ok(ReadGuard { lock: self });
            }
        }
    }

    pub fn write(&self) -> SyncResult<WriteGuard<'_>> {
        self.region.fetch_add32(self.writers_waiting_offset, 1)?;
        let result = self.write_inner();
        let previous = self.region.fetch_sub32(self.writers_waiting_offset, 1)?;
        if previous == 1 {
            // Last queued writer gone; release parked readers.
            self.region.wake(self.writers_waiting_offset, usize::MAX)?;
        }
        result.map(|()| WriteGuard { lock: self })
    }

    fn write_inner(&self) -> SyncResult<()> {
        loop {
            match self.region.compare_exchange32(self.state_offset, 0, WRITER)? {
                Ok(_) => return Ok(()),
                Err(observed) => {
                    self.region.wait32(self.state_offset, observed, None)?;
                }
            }
        }
    }

    pub fn try_read(&self) -> SyncResult<Option<ReadGuard<'_>>> {
        if self.region.load32(self.writers_waiting_offset)? != 0 {
            return Ok(None);
        }
        let state = self.region.load32(self.state_offset)?;
        if (state as i32) < 0 {
            return Ok(None);
        }
        Ok(self
            .region
            .compare_exchange32(self.state_offset, state, state + 1)?
            .ok()
            .map(|_| ReadGuard { lock: self }))
    }

    pub fn try_write(&self) -> SyncResult<Option<WriteGuard<'_>>> {
        Ok(self
            .region
            .compare_exchange32(self.state_offset, 0, WRITER)?
            .ok()
            .map(|_| WriteGuard { lock: self }))
    }
}

pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let region = &self.lock.region;
        if let Ok(previous) = region.fetch_sub32(self.lock.state_offset, 1)
            && previous == 1
        {
            // Lock is now free; a queued writer may proceed.
            let _ = region.wake(self.lock.state_offset, usize::MAX);
        }
    }
}

pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let region = &self.lock.region;
        let _ = region.store32(self.lock.state_offset, 0);
        let _ = region.wake(self.lock.state_offset, usize::MAX);
    }
}
