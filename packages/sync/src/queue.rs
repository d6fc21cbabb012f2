//! Bounded multi-producer multi-consumer queue of 32-bit words.

use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult, WaitResult};
use crate::mutex::Mutex;
use crate::region::SharedRegion;

/// Bounded concurrent FIFO over region words.
///
/// Layout from the base offset: `head`, `tail`, `size`, `lock`, then
/// `capacity` value slots. All structural mutation happens under the lock
/// word; the `size` word doubles as the waitable empty/non-empty condition.
/// `enqueue` on a full queue fails with [`SyncError::Full`]; `dequeue` on an
/// empty queue parks on the size word until an enqueue wakes it.
pub struct BoundedQueue {
    region: SharedRegion,
    lock: Mutex,
    head_offset: usize,
    tail_offset: usize,
    size_offset: usize,
    slots_offset: usize,
    capacity: u32,
}

impl BoundedQueue {
    /// Bytes used inside the shared region for a queue of `capacity` slots.
    pub const fn footprint(capacity: u32) -> usize {
        16 + capacity as usize * 4
    }

    pub fn new(region: SharedRegion, offset: usize, capacity: u32) -> SyncResult<Self> {
        if capacity == 0 {
            return Err(SyncError::InvalidAddress { offset, width: 32 });
        }
        // Validate the full footprint up front.
        region.load32(offset + Self::footprint(capacity) - 4)?;
        let lock = Mutex::new(region.clone(), offset + 12)?;
        Ok(Self {
            region,
            lock,
            head_offset: offset,
            tail_offset: offset + 4,
            size_offset: offset + 8,
            slots_offset: offset + 16,
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> SyncResult<u32> {
        self.region.load32(self.size_offset)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn enqueue(&self, value: u32) -> SyncResult<()> {
        {
            let _guard = self.lock.lock()?;
            let size = self.region.load32(self.size_offset)?;
            if size == self.capacity {
                return Err(SyncError::Full);
            }
            let tail = self.region.load32(self.tail_offset)?;
            self.region
                .store32(self.slots_offset + tail as usize * 4, value)?;
            self.region
                .store32(self.tail_offset, (tail + 1) % self.capacity)?;
            self.region.fetch_add32(self.size_offset, 1)?;
        }
        self.region.wake(self.size_offset, 1)?;
        Ok(())
    }

    /// Pop the oldest value, blocking while the queue is empty.
    pub fn dequeue(&self) -> SyncResult<u32> {
        self.dequeue_inner(None)
    }

    /// As [`dequeue`](Self::dequeue) with an upper bound on the park time.
    pub fn dequeue_timeout(&self, timeout: Duration) -> SyncResult<u32> {
        self.dequeue_inner(Some(Instant::now() + timeout))
    }

    pub fn try_dequeue(&self) -> SyncResult<Option<u32>> {
        let _guard = self.lock.lock()?;
        self.pop_locked()
    }

    fn dequeue_inner(&self, deadline: Option<Instant>) -> SyncResult<u32> {
        loop {
            {
                let _guard = self.lock.lock()?;
                if let Some(value) = self.pop_locked()? {
                    return Ok(value);
                }
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(SyncError::TimedOut {
                            offset: self.size_offset,
                        });
                    }
                    Some(left)
                }
            };
            if self.region.wait32(self.size_offset, 0, remaining)? == WaitResult::TimedOut {
                return Err(SyncError::TimedOut {
                    offset: self.size_offset,
                });
            }
        }
    }

    fn pop_locked(&self) -> SyncResult<Option<u32>> {
        let size = self.region.load32(self.size_offset)?;
        if size == 0 {
            return Ok(None);
        }
        let head = self.region.load32(self.head_offset)?;
        let value = self.region.load32(self.slots_offset + head as usize * 4)?;
        self.region
            .store32(self.head_offset, (head + 1) % self.capacity)?;
        self.region.fetch_sub32(self.size_offset, 1)?;
        Ok(Some(value))
    }
}
