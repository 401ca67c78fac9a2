//! An example program that creates and destroys a large number of random
//! allocations on an mmap-backed heap, coalescing now and then and checking
//! validity along the way.

use core::ptr::NonNull;

use bestfit_heap::{AllocError, MmapHeap};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// Heap capacity in bytes
const CAPACITY: usize = 1 << 20;
// Total number of allocations / deallocations
const STEPS: usize = 64 * 1024;
// Log_2 of the maximum allocation size
const LOG2_MAX_SIZE: usize = 12;
// Coalesce after this many steps
const COALESCE_EVERY: usize = 256;

struct RandomObjects {
    allocated: Vec<NonNull<u8>>,
    sizes: Uniform<usize>,
    failures: usize,
}

impl RandomObjects {
    fn new(log2_max_size: usize) -> Self {
        RandomObjects {
            allocated: Vec::new(),
            sizes: Uniform::new_inclusive(1usize, 1 << log2_max_size),
            failures: 0,
        }
    }

    fn create<R: Rng>(&mut self, heap: &mut MmapHeap, rng: &mut R) {
        let size = self.sizes.sample(rng);
        match heap.allocate(size) {
            Ok(ptr) => self.allocated.push(ptr),
            Err(AllocError::OutOfMemory { .. }) => self.failures += 1,
            Err(err) => panic!("Unexpected allocation error: {}", err),
        }
    }

    fn destroy<R: Rng>(&mut self, heap: &mut MmapHeap, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.allocated.len()).sample(rng);
        let ptr = self.allocated.swap_remove(ix);
        if let Err(err) = heap.deallocate(ptr.as_ptr()) {
            panic!("Could not free {:?}: {}", ptr, err);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [CAPACITY] [STEPS] [LOG2_MAX_SIZE]", args[0]);
        return;
    }
    let capacity: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(CAPACITY);
    let steps: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let log2_max_size: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    env_logger::init();

    let mut heap = MmapHeap::default();
    if let Err(err) = heap.init(capacity) {
        eprintln!("Could not create a heap of {} bytes: {}", capacity, err);
        std::process::exit(1);
    }

    println!("Running Stress Test.\n\nParameters:");
    println!("    {} byte heap ({} usable)", capacity, heap.capacity());
    println!("    {} steps", steps);
    println!("    2^{} max allocation size", log2_max_size);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = RandomObjects::new(log2_max_size);

    for i in 1..=steps {
        if rng.gen_bool(0.55) {
            objects.create(&mut heap, &mut rng);
        } else {
            objects.destroy(&mut heap, &mut rng);
        }

        if i % COALESCE_EVERY == 0 {
            heap.coalesce();
        }

        let (validity, stats) = heap.stats();
        if i % 4096 == 0 {
            println!("Step {} / {}", i, steps);
            println!("    Live allocations: {}", objects.allocated.len());
            println!("    Failed allocations: {}", objects.failures);
            println!("    Heap stats: {:?}", stats);
        }
        assert!(validity.is_valid(), "{:?}", validity);
    }

    while !objects.allocated.is_empty() {
        objects.destroy(&mut heap, &mut rng);
    }
    heap.coalesce();

    let (validity, stats) = heap.stats();
    println!("\nFinished.");
    println!("    Stats:    {:?}", stats);
    println!("\n{}", heap);
    assert!(validity.is_coalesced());
}
