#![no_std]

//! A best-fit heap over a single fixed-capacity region.
//!
//! ## Basic Types
//!
//! ### [`Heap`](struct.Heap.html)
//!
//! A `Heap` acquires one region of memory when it is initialized, and hands
//! out blocks of it through [`Heap::allocate`] and [`Heap::deallocate`]. Each
//! block carries a one-word header in front of its payload; free blocks also
//! carry a one-word footer. Allocation picks the smallest free block that
//! fits and splits off whatever it doesn't need. Freeing never merges;
//! [`Heap::coalesce`] merges neighbouring free blocks in one pass.
//!
//! A `Heap` is single threaded and not a global allocator.
//!
//! ### [`RegionSource`](trait.RegionSource.html)
//!
//! `RegionSource` abstracts over where the region comes from.
//! [`MmapSource`] maps anonymous pages from the OS (Unix only), and
//! [`ToyRegion`] uses a plain buffer, which is mainly useful for testing.
//!
//! ### Diagnostics
//!
//! [`Heap::dump`] lists every block, [`Heap::stats`] checks the heap's
//! invariants, and the `Display` implementation of `Heap` prints a block
//! table.
//!
//! ```rust
//! use bestfit_heap::{Heap, ToyRegion};
//!
//! let mut heap = Heap::new(ToyRegion::default());
//! heap.init(4096).unwrap();
//!
//! let p = heap.allocate(100).unwrap();
//! heap.deallocate(p.as_ptr()).unwrap();
//! heap.coalesce();
//!
//! let (validity, stats) = heap.stats();
//! assert!(validity.is_coalesced());
//! assert_eq!(stats.blocks, 1);
//! ```

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod header;
pub mod heap;
pub mod region;
pub mod stats;

pub use error::{AllocError, FreeError, InitError};
pub use header::{block_size, BlockHeader};
pub use heap::Heap;
#[cfg(unix)]
pub use region::MmapSource;
pub use region::{RegionSource, ToyRegion, ToyRegionError};
pub use stats::{BlockInfo, Blocks, Stats, Validity};

/// A heap backed by anonymous memory maps.
#[cfg(unix)]
pub type MmapHeap = Heap<MmapSource>;
