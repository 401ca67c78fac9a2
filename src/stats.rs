//! Read-only views of a heap: per-block information, totals, and an
//! invariant check.

use crate::header::{BlockHeader, ALIGNMENT, FIRST_BLOCK, REGION_OVERHEAD};
use crate::region::Region;

/// One block, as seen by a walk over the heap.
///
/// `start` and `end` are byte offsets from the region base; `end` is
/// exclusive, so `size == end - start`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub index: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
    pub start: usize,
    pub end: usize,
    pub size: usize,
}

/// Iterator over the blocks of a heap, lowest address first.
///
/// Stops at the sentinel. A zero-sized or overrunning block also ends the
/// walk, so a damaged heap can still be inspected.
pub struct Blocks<'heap> {
    region: Option<&'heap Region>,
    offset: usize,
    index: usize,
}

impl<'heap> Blocks<'heap> {
    pub(crate) fn new(region: Option<&'heap Region>) -> Self {
        Blocks {
            region,
            offset: FIRST_BLOCK,
            index: 0,
        }
    }
}

impl<'heap> Iterator for Blocks<'heap> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.region?;
        let sentinel = region.sentinel();
        if self.offset >= sentinel {
            return None;
        }

        let BlockHeader {
            size,
            allocated,
            prev_allocated,
        } = region.header(self.offset);
        if size == 0 || size > sentinel - self.offset {
            self.region = None;
            return None;
        }

        let info = BlockInfo {
            index: self.index,
            allocated,
            prev_allocated,
            start: self.offset,
            end: self.offset + size,
            size,
        };
        self.offset = info.end;
        self.index += 1;

        Some(info)
    }
}

/// Validity contains a representation of all invalid states found in a
/// heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Blocks whose size is zero, not a multiple of 8, or reaches past the
    /// sentinel.
    ///
    /// This indicates corruption, and ends the walk.
    pub misaligned: usize,
    /// Blocks whose `prev_allocated` flag disagrees with the block before.
    pub stale_prev: usize,
    /// Free blocks whose footer differs from their header's size.
    pub footer_mismatches: usize,
    /// Bytes of the region not accounted for by blocks and overhead.
    ///
    /// Non-zero if the walk stopped at a bad block before reaching the
    /// sentinel.
    pub lost_bytes: usize,
    /// Pairs of free blocks next to each other. This is normal between calls
    /// to `coalesce`, but not right after one.
    pub adjacent_free: usize,
}

impl Validity {
    /// Whether the heap is structurally sound. Adjacent free blocks are
    /// allowed.
    pub fn is_valid(&self) -> bool {
        self.misaligned == 0
            && self.stale_prev == 0
            && self.footer_mismatches == 0
            && self.lost_bytes == 0
    }

    /// Whether the heap is sound and has no free blocks left to merge.
    pub fn is_coalesced(&self) -> bool {
        self.is_valid() && self.adjacent_free == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub allocated_size: usize,
    pub free_size: usize,
    pub region_len: usize,
}

impl Stats {
    /// Bytes covered by blocks.
    pub fn size(&self) -> usize {
        self.allocated_size + self.free_size
    }
}

pub(crate) fn check(region: &Region) -> (Validity, Stats) {
    let mut validity = Validity::default();
    let mut stats = Stats {
        region_len: region.len(),
        ..Stats::default()
    };

    // Nothing precedes the first block; it counts as allocated.
    let mut prev_allocated = true;
    let mut offset = FIRST_BLOCK;
    let sentinel = region.sentinel();

    while offset < sentinel {
        let header = region.header(offset);
        if header.size == 0 || header.size % ALIGNMENT != 0 || header.size > sentinel - offset {
            validity.misaligned += 1;
            break;
        }

        if header.prev_allocated != prev_allocated {
            validity.stale_prev += 1;
        }

        stats.blocks += 1;
        if header.allocated {
            stats.allocated_blocks += 1;
            stats.allocated_size += header.size;
        } else {
            stats.free_blocks += 1;
            stats.free_size += header.size;
            if region.footer(offset, header.size) != header.size {
                validity.footer_mismatches += 1;
            }
            if !prev_allocated {
                validity.adjacent_free += 1;
            }
        }

        prev_allocated = header.allocated;
        offset += header.size;
    }

    validity.lost_bytes = region.len() - REGION_OVERHEAD - stats.size();

    (validity, stats)
}
