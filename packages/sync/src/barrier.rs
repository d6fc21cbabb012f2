//! Reusable rendezvous point for a fixed set of participants.

use crate::error::{SyncError, SyncResult};
use crate::region::SharedRegion;

/// Two-word barrier: `waiting` counts arrivals in the current phase and
/// `generation` increments when a phase completes. The n-th arrival resets
/// the count, bumps the generation and wakes everyone; earlier arrivals park
/// on the generation word. Reusable across phases.
pub struct Barrier {
    region: SharedRegion,
    waiting_offset: usize,
    generation_offset: usize,
    participants: u32,
}

/// Whether this thread was the one that tripped the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    Leader,
    Follower,
}

impl Barrier {
    /// Words used inside the shared region.
    pub const FOOTPRINT: usize = 8;

    /// `participants` must be at least 1; a single-participant barrier trips
    /// immediately on every `wait`.
    pub fn new(region: SharedRegion, offset: usize, participants: u32) -> SyncResult<Self> {
        if participants == 0 {
            return Err(SyncError::InvalidAddress { offset, width: 32 });
        }
        region.load32(offset)?;
        region.load32(offset + 4)?;
        Ok(Self {
            region,
            waiting_offset: offset,
            generation_offset: offset + 4,
            participants,
        })
    }

    pub fn wait(&self) -> SyncResult<BarrierWaitResult> {
        let generation = self.region.load32(self.generation_offset)?;
        let arrived = self.region.fetch_add32(self.waiting_offset, 1)? + 1;

        if arrived == self.participants {
            self.region.store32(self.waiting_offset, 0)?;
            self.region.fetch_add32(self.generation_offset, 1)?;
            self.region.wake(self.generation_offset, usize::MAX)?;
            return Ok(BarrierWaitResult::Leader);
        }

        while self.region.load32(self.generation_offset)? == generation {
            self.region.wait32(self.generation_offset, generation, None)?;
        }
        Ok(BarrierWaitResult::Follower)
    }
}
