//! Fiber registry: identifier allocation and lock-free lookup.
//!
//! Records live in an append-only table of geometrically growing segments.
//! Segment `k` holds `FIRST_SEGMENT << k` slots and is never moved or freed
//! while the registry lives, so a reader only needs two acquire loads (the
//! segment pointer and the slot) to find a record. Writers serialize on
//! `next_id`.

use crate::error::{FiberError, Result};
use crate::fiber::{Fiber, FiberId};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const FIRST_SEGMENT: usize = 32;

type Slot = OnceLock<Arc<Fiber>>;

pub struct Registry {
    segments: Box<[AtomicPtr<Slot>]>,
    /// Next identifier to hand out. Held for the whole insertion.
    next_id: Mutex<u64>,
    /// Number of identifiers published so far.
    published: AtomicU64,
    capacity: usize,
}

/// Segment index, offset within it, and segment length for an identifier.
fn locate(index: usize) -> (usize, usize, usize) {
    let n = index / FIRST_SEGMENT + 1;
    let segment = (usize::BITS - 1 - n.leading_zeros()) as usize;
    let start = FIRST_SEGMENT * ((1 << segment) - 1);
    (segment, index - start, FIRST_SEGMENT << segment)
}

impl Registry {
    /// Create a registry that hands out at most `capacity` identifiers.
    pub fn new(capacity: usize) -> Self {
        let segments = if capacity == 0 {
            0
        } else {
            locate(capacity - 1).0 + 1
        };
        Registry {
            segments: (0..segments).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            next_id: Mutex::new(0),
            published: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of registered fibers.
    pub fn len(&self) -> usize {
        self.published.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate an identifier for `fiber` and publish it.
    ///
    /// On failure the record is dropped and never becomes visible.
    pub fn register(&self, mut fiber: Fiber) -> Result<Arc<Fiber>> {
        let mut next_id = self.next_id.lock().unwrap();
        let index = *next_id as usize;
        if index >= self.capacity {
            tracing::warn!(capacity = self.capacity, "fiber registry exhausted");
            return Err(FiberError::RegistryFull {
                capacity: self.capacity,
            });
        }

        let id = FiberId(*next_id);
        let (segment, offset, len) = locate(index);
        let base = self.segment_or_alloc(segment, len);

        fiber.set_id(id);
        // The slot is fresh: identifiers are never reused.
        let slot = unsafe { &*base.add(offset) };
        let fiber = Arc::new(fiber);
        if slot.set(Arc::clone(&fiber)).is_err() {
            tracing::warn!(%id, "fiber slot already occupied");
            return Err(FiberError::Registration(id));
        }

        *next_id += 1;
        self.published.store(*next_id, Ordering::Release);
        Ok(fiber)
    }

    /// Find the fiber registered under `id`. Never blocks.
    pub fn lookup(&self, id: FiberId) -> Option<Arc<Fiber>> {
        let index = usize::try_from(id.0).ok()?;
        if index >= self.capacity {
            return None;
        }
        let (segment, offset, _) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        let slot = unsafe { &*base.add(offset) };
        slot.get().cloned()
    }

    /// Snapshot of every published fiber, in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Fiber>> + '_ {
        (0..self.published.load(Ordering::Acquire)).filter_map(|id| self.lookup(FiberId(id)))
    }

    /// Called with `next_id` held.
    fn segment_or_alloc(&self, segment: usize, len: usize) -> *mut Slot {
        let base = self.segments[segment].load(Ordering::Acquire);
        if !base.is_null() {
            return base;
        }
        let slots: Box<[Slot]> = (0..len).map(|_| OnceLock::new()).collect();
        let base = Box::into_raw(slots) as *mut Slot;
        self.segments[segment].store(base, Ordering::Release);
        base
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (segment, ptr) in self.segments.iter_mut().enumerate() {
            let base = *ptr.get_mut();
            if base.is_null() {
                continue;
            }
            let len = FIRST_SEGMENT << segment;
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)));
            }
        }
    }
}

// Segments are only written under `next_id` and published with release
// stores; slots are `OnceLock`s.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Context, FpuState};
    use std::sync::Barrier;
    use std::thread;

    fn record(entry: usize) -> Fiber {
        Fiber::stopped(Context::default(), FpuState::default(), 0, entry, None)
    }

    #[test]
    fn locate_covers_segments_contiguously() {
        assert_eq!(locate(0), (0, 0, 32));
        assert_eq!(locate(31), (0, 31, 32));
        assert_eq!(locate(32), (1, 0, 64));
        assert_eq!(locate(95), (1, 63, 64));
        assert_eq!(locate(96), (2, 0, 128));
    }

    #[test]
    fn ids_are_allocated_monotonically() {
        let registry = Registry::new(100);
        for expected in 0..70u64 {
            let fiber = registry.register(record(expected as usize)).unwrap();
            assert_eq!(fiber.id(), FiberId(expected));
        }
        assert_eq!(registry.len(), 70);
        let fiber = registry.lookup(FiberId(65)).unwrap();
        assert_eq!(fiber.id(), FiberId(65));
        assert_eq!(fiber.entry_point(), 65);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = Registry::new(8);
        assert!(registry.lookup(FiberId(0)).is_none());
        registry.register(record(0)).unwrap();
        assert!(registry.lookup(FiberId(0)).is_some());
        assert!(registry.lookup(FiberId(1)).is_none());
        assert!(registry.lookup(FiberId(u64::MAX)).is_none());
    }

    #[test]
    fn registration_fails_when_full() {
        let registry = Registry::new(2);
        registry.register(record(0)).unwrap();
        registry.register(record(1)).unwrap();
        assert_eq!(
            registry.register(record(2)).unwrap_err(),
            FiberError::RegistryFull { capacity: 2 }
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_registration_yields_distinct_ids() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;
        let registry = Arc::new(Registry::new(THREADS * PER_THREAD));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|i| {
                            let id = registry.register(record(i)).unwrap().id();
                            // Readers racing with other writers see whole records.
                            assert_eq!(registry.lookup(id).unwrap().id(), id);
                            id.0
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), THREADS * PER_THREAD);
        assert_eq!(registry.iter().count(), THREADS * PER_THREAD);
    }
}
