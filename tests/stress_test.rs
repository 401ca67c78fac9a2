use core::ptr::null_mut;

use bestfit_heap::{block_size, AllocError, Heap, ToyRegion};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

// Each live allocation: payload pointer, requested size, and the byte its
// payload was filled with.
type Slot = (*mut u8, usize, u8);

fn validate(heap: &Heap<ToyRegion>, allocated_size: usize) {
    let (validity, stats) = heap.stats();
    log::debug!(
        "Allocated: {}; Validity: {:?}, Stats: {:?}",
        allocated_size,
        validity,
        stats,
    );
    assert!(validity.is_valid(), "{:?}\n{}", validity, heap);

    // Conservation: blocks and overhead always cover the whole region.
    assert_eq!(stats.size(), heap.capacity());
    assert_eq!(stats.allocated_size, allocated_size);
}

fn check_payload(slot: &Slot) {
    let &(ptr, size, fill) = slot;
    let payload = unsafe { core::slice::from_raw_parts(ptr, size) };
    assert!(payload.iter().all(|&b| b == fill), "payload at {:?} was overwritten", ptr);
}

#[test]
fn test_stress() {
    let mut heap = Heap::new(ToyRegion::new(64, 64 * 1024));
    heap.init(64 * 1024).unwrap();

    let mut slots: [Slot; 128] = [(null_mut(), 0, 0); 128];
    let mut allocated_size: usize = 0;
    let mut failures: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for step in 0..1024 * 10 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        if chosen.0.is_null() {
            // Let's try allocating
            let size = range.sample(&mut rng) * range.sample(&mut rng);
            let before = heap.dump();
            match heap.allocate(size) {
                Ok(ptr) => {
                    assert_eq!(ptr.as_ptr() as usize % 8, 0);
                    let fill: u8 = rng.gen();
                    unsafe { core::ptr::write_bytes(ptr.as_ptr(), fill, size) };
                    *chosen = (ptr.as_ptr(), size, fill);
                    allocated_size += block_size(size).unwrap();
                }
                Err(AllocError::OutOfMemory { requested }) => {
                    assert_eq!(requested, size);
                    assert_eq!(heap.dump(), before);
                    failures += 1;
                }
                Err(err) => panic!("Unexpected error {}", err),
            }
        } else {
            // Let's try freeing
            check_payload(chosen);
            heap.deallocate(chosen.0).unwrap();
            allocated_size -= block_size(chosen.1).unwrap();
            *chosen = (null_mut(), 0, 0);
        }

        if step % 64 == 0 {
            heap.coalesce();
            let (validity, _) = heap.stats();
            assert!(validity.is_coalesced(), "{:?}", validity);
        }

        // And validate that everything is ok
        validate(&heap, allocated_size);
    }

    log::info!("{} allocations failed for lack of memory", failures);

    for slot in slots.iter_mut().filter(|s| !s.0.is_null()) {
        check_payload(slot);
        heap.deallocate(slot.0).unwrap();
        *slot = (null_mut(), 0, 0);
    }

    heap.coalesce();
    let blocks = heap.dump();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, heap.capacity());
    validate(&heap, 0);
}

#[test]
fn test_fill_and_drain() {
    let mut heap = Heap::new(ToyRegion::with_page_size(8));
    heap.init(4096).unwrap();

    // Fill the heap with equal blocks until it refuses.
    let mut pointers = Vec::new();
    while let Ok(ptr) = heap.allocate(20) {
        pointers.push(ptr);
    }
    let (validity, stats) = heap.stats();
    assert!(validity.is_valid());
    assert!(stats.free_size < 24);

    // Free every other block; none of the holes can be merged.
    for ptr in pointers.iter().step_by(2) {
        heap.deallocate(ptr.as_ptr()).unwrap();
    }
    assert_eq!(heap.coalesce(), 0);

    // A request bigger than any hole fails, and one that fits reuses the
    // first hole.
    assert!(heap.allocate(40).is_err());
    assert_eq!(heap.allocate(20).unwrap(), pointers[0]);

    for ptr in pointers.iter().skip(1).step_by(2) {
        heap.deallocate(ptr.as_ptr()).unwrap();
    }
    heap.deallocate(pointers[0].as_ptr()).unwrap();
    heap.coalesce();

    let (validity, stats) = heap.stats();
    assert!(validity.is_coalesced());
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.free_size, heap.capacity());
}
