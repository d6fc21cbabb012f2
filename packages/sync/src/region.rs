//! Fixed-size shared memory region with word-granular atomic access.
//!
//! The region is allocated once, never resized, and every access after
//! construction goes through sequentially consistent atomic operations
//! addressed by byte offset. On top of the plain load/store/rmw surface the
//! region offers futex-style [`wait32`](SharedRegion::wait32) /
//! [`wake`](SharedRegion::wake): a thread can block until a 32-bit word
//! stops holding an expected value, and another thread can release up to
//! `n` such waiters. All higher-level primitives in this crate are built on
//! exactly this surface.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult, WaitResult};

/// Handle to a shared region. Clones are cheap and observe the same memory.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

struct RegionInner {
    /// Backing storage. `u64` cells guarantee 8-byte alignment for the
    /// widest atomic access; the bytes are only ever touched through
    /// `AtomicU32` / `AtomicU64` references derived below.
    buf: Box<[UnsafeCell<u64>]>,
    len: usize,
    waiters: WaiterTable,
}

// Mutation is confined to atomic operations on the buffer words.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

impl SharedRegion {
    /// Allocate a zeroed region of at least `len_bytes` bytes (rounded up to
    /// a multiple of 8). The length is fixed for the region's lifetime.
    pub fn new(len_bytes: usize) -> SyncResult<Self> {
        if len_bytes == 0 {
            return Err(SyncError::OutOfBounds {
                offset: 0,
                len: 0,
                region_len: 0,
            });
        }
        let words = len_bytes.div_ceil(8);
        let buf: Vec<UnsafeCell<u64>> = (0..words).map(|_| UnsafeCell::new(0)).collect();
        Ok(Self {
            inner: Arc::new(RegionInner {
                buf: buf.into_boxed_slice(),
                len: words * 8,
                waiters: WaiterTable::new(),
            }),
        })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    fn check(&self, offset: usize, width_bytes: usize) -> SyncResult<()> {
        if offset % width_bytes != 0 {
            return Err(SyncError::InvalidAddress {
                offset,
                width: (width_bytes * 8) as u32,
            });
        }
        if offset + width_bytes > self.inner.len {
            return Err(SyncError::OutOfBounds {
                offset,
                len: width_bytes,
                region_len: self.inner.len,
            });
        }
        Ok(())
    }

    fn atomic32(&self, offset: usize) -> SyncResult<&AtomicU32> {
        self.check(offset, 4)?;
        let base = self.inner.buf[0].get() as *mut u8;
        // Safety: offset is 4-aligned and in bounds (checked above); the
        // backing memory is only accessed through atomics after construction.
        Ok(unsafe { AtomicU32::from_ptr(base.add(offset) as *mut u32) })
    }

    fn atomic64(&self, offset: usize) -> SyncResult<&AtomicU64> {
        self.check(offset, 8)?;
        let base = self.inner.buf[0].get() as *mut u8;
        // Safety: as above, with 8-byte alignment.
        Ok(unsafe { AtomicU64::from_ptr(base.add(offset) as *mut u64) })
    }

    // 32-bit operations

    pub fn load32(&self, offset: usize) -> SyncResult<u32> {
        Ok(self.atomic32(offset)?.load(Ordering::SeqCst))
    }

    pub fn store32(&self, offset: usize, value: u32) -> SyncResult<()> {
        self.atomic32(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Wrapping add; returns the previous value.
    pub fn fetch_add32(&self, offset: usize, value: u32) -> SyncResult<u32> {
        Ok(self.atomic32(offset)?.fetch_add(value, Ordering::SeqCst))
    }

    /// Wrapping subtract; returns the previous value.
    pub fn fetch_sub32(&self, offset: usize, value: u32) -> SyncResult<u32> {
        Ok(self.atomic32(offset)?.fetch_sub(value, Ordering::SeqCst))
    }

    /// Compare-and-swap. The inner result carries the previous value on
    /// failure, matching the std atomics contract.
    pub fn compare_exchange32(
        &self,
        offset: usize,
        current: u32,
        new: u32,
    ) -> SyncResult<Result<u32, u32>> {
        Ok(self
            .atomic32(offset)?
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst))
    }

    // 64-bit operations

    pub fn load64(&self, offset: usize) -> SyncResult<u64> {
        Ok(self.atomic64(offset)?.load(Ordering::SeqCst))
    }

    pub fn store64(&self, offset: usize, value: u64) -> SyncResult<()> {
        self.atomic64(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    pub fn fetch_add64(&self, offset: usize, value: u64) -> SyncResult<u64> {
        Ok(self.atomic64(offset)?.fetch_add(value, Ordering::SeqCst))
    }

    pub fn fetch_sub64(&self, offset: usize, value: u64) -> SyncResult<u64> {
        Ok(self.atomic64(offset)?.fetch_sub(value, Ordering::SeqCst))
    }

    pub fn compare_exchange64(
        &self,
        offset: usize,
        current: u64,
        new: u64,
    ) -> SyncResult<Result<u64, u64>> {
        Ok(self
            .atomic64(offset)?
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst))
    }

    // Futex-style wait / wake. Waits are 32-bit, per the usual futex
    // convention; 64-bit words are for counters, not conditions.

    /// Block while the word at `offset` holds `expected`.
    ///
    /// Returns [`WaitResult::NotEqual`] without blocking if the word already
    /// differs, [`WaitResult::Woken`] when released by [`wake`](Self::wake),
    /// and [`WaitResult::TimedOut`] if `timeout` elapses first. A `None`
    /// timeout waits indefinitely.
    pub fn wait32(
        &self,
        offset: usize,
        expected: u32,
        timeout: Option<Duration>,
    ) -> SyncResult<WaitResult> {
        let atom = self.atomic32(offset)?;
        let slot = self.inner.waiters.slot(offset);
        let _registered = WaiterRegistration::new(&slot);

        let mut generation = lock_ignore_poison(&slot.generation);
        // Re-check under the slot lock: wake() bumps the generation under
        // the same lock, so a wake between the caller's last load and this
        // check cannot be lost.
        if atom.load(Ordering::SeqCst) != expected {
            return Ok(WaitResult::NotEqual);
        }
        let start_generation = *generation;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            generation = match deadline {
                None => slot
                    .condvar
                    .wait(generation)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(WaitResult::TimedOut);
                    }
                    let (guard, _) = slot
                        .condvar
                        .wait_timeout(generation, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
            };
            if *generation != start_generation {
                return Ok(WaitResult::Woken);
            }
        }
    }

    /// Release up to `n` threads blocked in [`wait32`](Self::wait32) on the
    /// word at `offset`. Returns the number of waiters signalled.
    pub fn wake(&self, offset: usize, n: usize) -> SyncResult<usize> {
        // Validate the address even when nobody is waiting.
        self.check(offset, 4)?;
        let Some(slot) = self.inner.waiters.existing_slot(offset) else {
            return Ok(0);
        };
        let waiting = slot.count.load(Ordering::SeqCst);
        if waiting == 0 || n == 0 {
            return Ok(0);
        }
        let mut generation = lock_ignore_poison(&slot.generation);
        *generation = generation.wrapping_add(1);
        drop(generation);

        let signalled = waiting.min(n);
        if signalled == waiting {
            slot.condvar.notify_all();
        } else {
            for _ in 0..signalled {
                slot.condvar.notify_one();
            }
        }
        Ok(signalled)
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.inner.len)
            .finish()
    }
}

/// One parking slot per waited-on word offset.
struct WaitSlot {
    generation: Mutex<u64>,
    condvar: Condvar,
    count: AtomicUsize,
}

struct WaiterTable {
    slots: Mutex<HashMap<usize, Arc<WaitSlot>>>,
}

impl WaiterTable {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, offset: usize) -> Arc<WaitSlot> {
        let mut slots = lock_ignore_poison(&self.slots);
        slots
            .entry(offset)
            .or_insert_with(|| {
                Arc::new(WaitSlot {
                    generation: Mutex::new(0),
                    condvar: Condvar::new(),
                    count: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    fn existing_slot(&self, offset: usize) -> Option<Arc<WaitSlot>> {
        lock_ignore_poison(&self.slots).get(&offset).cloned()
    }
}

/// Tracks membership in a slot's waiter count for the duration of a wait,
/// including early returns.
struct WaiterRegistration<'a> {
    slot: &'a WaitSlot,
}

impl<'a> WaiterRegistration<'a> {
    fn new(slot: &'a WaitSlot) -> Self {
        slot.count.fetch_add(1, Ordering::SeqCst);
        Self { slot }
    }
}

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        self.slot.count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // The internal parker never panics while holding these locks.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
