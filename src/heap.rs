//! The best-fit heap.
//!
//! A [`Heap`] owns one region from its [`RegionSource`], laid out as a
//! sequence of blocks followed by a sentinel:
//!
//! ```text
//!   offset 0     4                                              len-4  len
//!          ┌─────┬──────────┬─────────────┬──────────────┬──────┬──────┐
//!          │ pad │ hdr│data │ hdr│ ...│ftr│ hdr│ data    │ ...  │ end  │
//!          └─────┴──────────┴─────────────┴──────────────┴──────┴──────┘
//!                 allocated      free        allocated           sentinel
//! ```
//!
//! Allocation walks the blocks looking for the best fit, splitting off the
//! unused tail as a new free block. Deallocation only flips a block to free;
//! neighbouring free blocks are merged by an explicit [`Heap::coalesce`].

use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace};

use crate::error::{AllocError, FreeError, InitError};
use crate::header::{
    block_size, round_up, BlockHeader, ALIGNMENT, FIRST_BLOCK, HEADER_SIZE, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE, REGION_OVERHEAD, SENTINEL_WORD,
};
use crate::region::{Region, RegionSource};
use crate::stats::{BlockInfo, Blocks, Stats, Validity};

/// A heap managing a single fixed-capacity region.
///
/// The heap starts out empty; [`init`](Heap::init) acquires its region, and
/// [`release`](Heap::release) (or dropping the heap) gives it back.
///
/// It is single threaded: every mutating operation takes `&mut self`, and
/// the heap is neither `Send` nor `Sync`.
pub struct Heap<S: RegionSource> {
    source: S,
    region: Option<Region>,
}

impl<S: RegionSource + Default> Default for Heap<S> {
    fn default() -> Self {
        Heap::new(S::default())
    }
}

impl<S: RegionSource> Drop for Heap<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: RegionSource> Heap<S> {
    /// Create an uninitialized heap drawing its region from `source`.
    pub fn new(source: S) -> Self {
        Heap {
            source,
            region: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Bytes covered by blocks: the region length minus its fixed overhead.
    /// Zero before `init`.
    pub fn capacity(&self) -> usize {
        self.region
            .as_ref()
            .map(|r| r.len() - REGION_OVERHEAD)
            .unwrap_or(0)
    }

    /// Length of the acquired region. Zero before `init`.
    pub fn region_len(&self) -> usize {
        self.region.as_ref().map(Region::len).unwrap_or(0)
    }

    /// Acquire a region of at least `capacity` bytes, rounded up to the
    /// source's page size, and make it one big free block.
    pub fn init(&mut self, capacity: usize) -> Result<(), InitError<S::Err>> {
        if capacity == 0 {
            return Err(InitError::InvalidCapacity);
        }
        if self.region.is_some() {
            return Err(InitError::AlreadyInitialized);
        }

        let page_size = self.source.page_size();
        let len = round_up(capacity, page_size).ok_or(InitError::InvalidCapacity)?;
        if len < REGION_OVERHEAD + MIN_BLOCK_SIZE || len - REGION_OVERHEAD > MAX_BLOCK_SIZE {
            return Err(InitError::InvalidCapacity);
        }
        debug_assert_eq!(len % ALIGNMENT, 0);

        let base = unsafe { self.source.acquire(len) }.map_err(InitError::Resource)?;
        let mut region = unsafe { Region::new(base, len) };

        // Nothing precedes the first block, so it claims an allocated
        // predecessor and is never merged backwards.
        let size = len - REGION_OVERHEAD;
        region.set_header(FIRST_BLOCK, BlockHeader::new(size, false, true));
        region.set_footer(FIRST_BLOCK, size);
        let sentinel = region.sentinel();
        region.set_word(sentinel, SENTINEL_WORD);

        debug!(
            "Initialized heap: {} bytes requested, {} byte region at {:?}, {} usable",
            capacity, len, base, size
        );
        self.region = Some(region);

        Ok(())
    }

    /// Give the region back to its source. The heap can be initialized
    /// again afterwards. Every pointer handed out by this heap dangles.
    pub fn release(&mut self) {
        if let Some(region) = self.region.take() {
            debug!("Releasing {} byte region at {:?}", region.len(), region.base());
            unsafe { self.source.release(region.base(), region.len()) };
        }
    }

    /// Allocate a block with at least `size` bytes of payload, returning the
    /// address of the payload. Payloads are aligned to 8 bytes.
    ///
    /// The smallest free block that fits is used; ties go to the lowest
    /// address. On error the heap is unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }
        let out_of_memory = AllocError::OutOfMemory { requested: size };

        let region = self.region.as_mut().ok_or(out_of_memory)?;
        let needed = block_size(size).ok_or(out_of_memory)?;
        debug!("Allocating {} bytes in a block of {}", size, needed);

        let (offset, header) = best_fit(region, needed).ok_or(out_of_memory)?;
        let next = offset + header.size;

        if header.size == needed {
            trace!("  Exact fit at {}", offset);
            region.set_header(offset, BlockHeader { allocated: true, ..header });
            region.set_prev_allocated(next, true);
        } else {
            let remainder = header.size - needed;
            let split = offset + needed;
            trace!(
                "  Splitting {} bytes off block {}:{}, leaving {} free at {}",
                needed,
                offset,
                header.size,
                remainder,
                split
            );
            region.set_header(
                offset,
                BlockHeader::new(needed, true, header.prev_allocated),
            );
            region.set_header(split, BlockHeader::new(remainder, false, true));
            region.set_footer(split, remainder);
            region.set_prev_allocated(next, false);
        }

        Ok(region.address(offset + HEADER_SIZE))
    }

    /// Free the block whose payload starts at `ptr`.
    ///
    /// The pointer is checked before anything is written: it must be
    /// non-null, lie inside this heap's region, be 8-byte aligned, carry a
    /// plausible header that is followed by another header or the sentinel,
    /// and refer to an allocated block. On error the heap is unchanged.
    /// Free neighbours are not merged; see [`Heap::coalesce`].
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        let result = self.checked_block(ptr);
        let (offset, header) = match result {
            Ok(block) => block,
            Err(err) => {
                debug!("Refusing to free {:?}: {}", ptr, err);
                return Err(err);
            }
        };

        // checked_block succeeded, so there is a region.
        let region = match self.region.as_mut() {
            Some(region) => region,
            None => return Err(FreeError::OutOfBounds),
        };

        debug!("Freeing {} byte block at {}", header.size, offset);
        region.set_header(offset, BlockHeader { allocated: false, ..header });
        region.set_footer(offset, header.size);
        region.set_prev_allocated(offset + header.size, false);

        Ok(())
    }

    // Validate a pointer passed to `deallocate`, returning the offset and
    // header of its block. Only reads the header once the pointer is known
    // to be inside the region.
    fn checked_block(&self, ptr: *mut u8) -> Result<(usize, BlockHeader), FreeError> {
        if ptr.is_null() {
            return Err(FreeError::NullPointer);
        }
        let region = self.region.as_ref().ok_or(FreeError::OutOfBounds)?;

        let payload = region.offset_of(ptr).ok_or(FreeError::OutOfBounds)?;
        if payload < FIRST_BLOCK + HEADER_SIZE {
            return Err(FreeError::OutOfBounds);
        }
        if payload % ALIGNMENT != 0 {
            return Err(FreeError::Misaligned);
        }

        let offset = payload - HEADER_SIZE;
        let header = region.header(offset);
        if header.size == 0 || header.size % ALIGNMENT != 0 {
            return Err(FreeError::Misaligned);
        }
        if header.size > region.sentinel() - offset {
            return Err(FreeError::OutOfBounds);
        }
        if !header.allocated {
            return Err(FreeError::DoubleFree);
        }

        // A real block is followed by the sentinel or by another header.
        let next = offset + header.size;
        if !region.is_sentinel(next) {
            let following = region.header(next);
            if following.size == 0
                || following.size % ALIGNMENT != 0
                || following.size > region.sentinel() - next
            {
                return Err(FreeError::Misaligned);
            }
        }

        Ok((offset, header))
    }

    /// Merge every run of adjacent free blocks into a single block, in one
    /// pass over the heap. Returns the number of blocks absorbed.
    pub fn coalesce(&mut self) -> usize {
        let region = match self.region.as_mut() {
            Some(region) => region,
            None => return 0,
        };

        let sentinel = region.sentinel();
        let mut absorbed = 0;
        let mut offset = FIRST_BLOCK;

        while offset < sentinel {
            let mut header = region.header(offset);
            if header.allocated {
                offset += header.size;
                continue;
            }

            let mut next = offset + header.size;
            let mut merged = false;
            while next < sentinel {
                let next_header = region.header(next);
                if next_header.allocated {
                    break;
                }
                trace!(
                    "  Merging {}:{} into {}:{}",
                    next,
                    next_header.size,
                    offset,
                    header.size
                );
                header.size += next_header.size;
                next = offset + header.size;
                merged = true;
                absorbed += 1;
            }

            if merged {
                region.set_header(offset, header);
                region.set_footer(offset, header.size);
            }
            region.set_prev_allocated(next, false);

            offset = next;
        }

        if absorbed > 0 {
            debug!("Coalesced {} free blocks", absorbed);
        }
        absorbed
    }

    /// Iterate over the blocks of the heap, lowest address first.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.region.as_ref())
    }

    /// A snapshot of every block in the heap.
    pub fn dump(&self) -> Vec<BlockInfo> {
        self.blocks().collect()
    }

    /// Check the heap's invariants and total up its blocks.
    pub fn stats(&self) -> (Validity, Stats) {
        match self.region.as_ref() {
            Some(region) => crate::stats::check(region),
            None => (Validity::default(), Stats::default()),
        }
    }
}

// Find the best free block for a block of `needed` bytes: an exact fit if one
// exists, else the smallest larger block, the first one found on ties.
fn best_fit(region: &Region, needed: usize) -> Option<(usize, BlockHeader)> {
    let sentinel = region.sentinel();
    let mut best: Option<(usize, BlockHeader)> = None;
    let mut offset = FIRST_BLOCK;

    while offset < sentinel {
        let header = region.header(offset);
        let next = offset + header.size;
        if header.allocated || header.size < needed {
            offset = next;
            continue;
        }

        if header.size == needed {
            return Some((offset, header));
        }

        match best {
            Some((_, current)) if current.size <= header.size => {}
            _ => best = Some((offset, header)),
        }
        offset = next;
    }

    best
}

const RULE: &str = "------------------------------------------------------------------------";

impl<S: RegionSource> fmt::Display for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap block list")?;
        writeln!(f, "No.\tStatus\tPrev\tBegin\t\tEnd\t\tSize")?;
        writeln!(f, "{}", RULE)?;

        let base = self
            .region
            .as_ref()
            .map(|r| r.base().as_ptr() as usize)
            .unwrap_or(0);
        for block in self.blocks() {
            writeln!(
                f,
                "{}\t{}\t{}\t{:#010x}\t{:#010x}\t{:4}",
                block.index + 1,
                if block.allocated { "alloc" } else { "FREE " },
                if block.prev_allocated { "alloc" } else { "FREE " },
                base + block.start,
                base + block.end - 1,
                block.size,
            )?;
        }

        let (_, stats) = self.stats();
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Total used size = {:4}", stats.allocated_size)?;
        writeln!(f, "Total free size = {:4}", stats.free_size)?;
        writeln!(f, "Total size      = {:4}", stats.allocated_size + stats.free_size)
    }
}
