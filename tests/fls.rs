use fibers::{ErrorKind, FiberConfig, FiberError, FiberSpace};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn space_with_slots(slots: usize) -> FiberSpace {
    FiberSpace::with_config(FiberConfig::default().with_fls_capacity(slots))
}

#[test]
fn fill_free_and_refill() {
    let space = space_with_slots(4);

    let slots: HashSet<usize> = (0..4).map(|_| space.fls_alloc().unwrap()).collect();
    assert_eq!(slots, HashSet::from([0, 1, 2, 3]));

    let err = space.fls_alloc().unwrap_err();
    assert_eq!(err, FiberError::FlsExhausted);
    assert_eq!(err.kind(), ErrorKind::Allocation);

    space.fls_free(2).unwrap();
    assert_eq!(space.fls_alloc(), Ok(2));
}

#[test]
fn values_are_shared_by_the_whole_space() {
    let space = Arc::new(space_with_slots(16));
    let slot = space.fls_alloc().unwrap() as i64;

    {
        let space = Arc::clone(&space);
        thread::spawn(move || space.fls_set(slot, 0x5eed).unwrap())
            .join()
            .unwrap();
    }
    assert_eq!(space.fls_get(slot), Ok(0x5eed));

    // Any thread may free any slot.
    {
        let space = Arc::clone(&space);
        thread::spawn(move || space.fls_free(slot).unwrap())
            .join()
            .unwrap();
    }
    assert_eq!(space.fls_get(slot).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn spaces_have_independent_tables() {
    let a = space_with_slots(1);
    let b = space_with_slots(1);
    assert_eq!(a.fls_alloc(), Ok(0));
    assert_eq!(b.fls_alloc(), Ok(0));
    a.fls_set(0, 1).unwrap();
    b.fls_set(0, 2).unwrap();
    assert_eq!(a.fls_get(0), Ok(1));
    assert_eq!(b.fls_get(0), Ok(2));
}

#[test]
fn contended_alloc_and_free_keep_slots_unique() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 500;
    let space = Arc::new(space_with_slots(THREADS));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let space = Arc::clone(&space);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERATIONS {
                    // Capacity equals the thread count, so every alloc succeeds.
                    let slot = space.fls_alloc().unwrap() as i64;
                    let tag = ((t as u64) << 32) | i as u64;
                    space.fls_set(slot, tag).unwrap();
                    // Nobody else holds this slot until we free it.
                    assert_eq!(space.fls_get(slot), Ok(tag));
                    space.fls_free(slot).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(space.fls().allocated_count(), 0);
}
