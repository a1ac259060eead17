//! Fiber-local storage slot table.
//!
//! A fixed number of 64-bit slots shared by every fiber of a space. Slot
//! ownership lives in an atomic bitmap; allocation is first-fit and retries
//! the scan when another thread claims the same bit first.

use crate::error::{FiberError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = u64::BITS as usize;

pub struct FlsTable {
    bitmap: Box<[AtomicU64]>,
    values: Box<[AtomicU64]>,
    capacity: usize,
}

impl FlsTable {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(WORD_BITS);
        FlsTable {
            bitmap: (0..words).map(|_| AtomicU64::new(0)).collect(),
            values: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the first free slot.
    pub fn alloc(&self) -> Result<usize> {
        loop {
            let Some(index) = self.first_zero_bit() else {
                tracing::warn!(capacity = self.capacity, "no free fls slot");
                return Err(FiberError::FlsExhausted);
            };
            let (word, mask) = bit(index);
            let old = self.bitmap[word].fetch_or(mask, Ordering::AcqRel);
            if old & mask == 0 {
                tracing::trace!(index, "fls slot allocated");
                return Ok(index);
            }
            // Lost the race for this bit, scan again.
        }
    }

    /// Release a slot. No ownership check: any caller may free any slot.
    pub fn free(&self, index: i64) -> Result<()> {
        let index = self.checked(index)?;
        let (word, mask) = bit(index);
        self.bitmap[word].fetch_and(!mask, Ordering::AcqRel);
        tracing::trace!(index, "fls slot freed");
        Ok(())
    }

    pub fn set(&self, index: i64, value: u64) -> Result<()> {
        let index = self.allocated(index)?;
        self.values[index].store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, index: i64) -> Result<u64> {
        let index = self.allocated(index)?;
        Ok(self.values[index].load(Ordering::Relaxed))
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (word, mask) = bit(index);
        self.bitmap[word].load(Ordering::Acquire) & mask != 0
    }

    /// Number of slots currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.bitmap
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn first_zero_bit(&self) -> Option<usize> {
        for (word, bits) in self.bitmap.iter().enumerate() {
            let bits = bits.load(Ordering::Acquire);
            if bits == u64::MAX {
                continue;
            }
            let index = word * WORD_BITS + bits.trailing_ones() as usize;
            return (index < self.capacity).then_some(index);
        }
        None
    }

    fn checked(&self, index: i64) -> Result<usize> {
        match usize::try_from(index) {
            Ok(i) if i < self.capacity => Ok(i),
            _ => Err(FiberError::InvalidSlot {
                index,
                capacity: self.capacity,
            }),
        }
    }

    fn allocated(&self, index: i64) -> Result<usize> {
        let index = self.checked(index)?;
        if self.is_allocated(index) {
            Ok(index)
        } else {
            Err(FiberError::SlotNotAllocated(index))
        }
    }
}

fn bit(index: usize) -> (usize, u64) {
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}
