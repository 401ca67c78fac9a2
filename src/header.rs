//! In-band block metadata: the header record, its word encoding, and the
//! layout constants of a heap region.
//!
//! Every block begins with a single 32-bit header word. Block sizes are
//! always multiples of [`ALIGNMENT`], which leaves the low bits of the size
//! free to carry two flags:
//!
//! ```text
//!   bit 0: this block is allocated
//!   bit 1: the block before this one is allocated
//! ```
//!
//! Free blocks also end in a footer word holding their size, so that the
//! block before an arbitrary header can be found without a scan.
//!
//! The packing only exists in [`BlockHeader::encode`] and
//! [`BlockHeader::decode`]; everything else works with the decoded record.

use static_assertions::const_assert;

/// Block sizes and payload addresses are multiples of this.
pub const ALIGNMENT: usize = 8;

/// Size of the header word in front of every block.
pub const HEADER_SIZE: usize = core::mem::size_of::<u32>();

/// Size of the footer word at the end of every free block.
pub const FOOTER_SIZE: usize = core::mem::size_of::<u32>();

/// Offset of the first block within the region.
///
/// The region base is at least 8-byte aligned, so skipping one word puts the
/// first payload (and therefore every payload) on an 8-byte boundary.
pub const FIRST_BLOCK: usize = 4;

/// Size of the end marker at the end of the region.
pub const SENTINEL_SIZE: usize = core::mem::size_of::<u32>();

/// Bytes of every region not covered by any block.
pub const REGION_OVERHEAD: usize = FIRST_BLOCK + SENTINEL_SIZE;

/// The smallest block: room for a header and a footer.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// The largest block size the header word can describe.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

// The encoded sentinel: size 0, allocated.
pub(crate) const SENTINEL_WORD: u32 = ALLOCATED_BIT;

const ALLOCATED_BIT: u32 = 0b01;
const PREV_ALLOCATED_BIT: u32 = 0b10;
const FLAG_MASK: u32 = ALLOCATED_BIT | PREV_ALLOCATED_BIT;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!((FIRST_BLOCK + HEADER_SIZE) % ALIGNMENT == 0);
const_assert!(MIN_BLOCK_SIZE <= ALIGNMENT);
const_assert!(REGION_OVERHEAD % ALIGNMENT == 0);
const_assert!(FLAG_MASK < ALIGNMENT as u32);

/// The decoded header of one block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Total size of the block in bytes, header (and footer) included.
    pub size: usize,
    /// Whether the block is handed out to a caller.
    pub allocated: bool,
    /// Whether the block immediately before this one is allocated.
    pub prev_allocated: bool,
}

impl BlockHeader {
    pub fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        BlockHeader {
            size,
            allocated,
            prev_allocated,
        }
    }

    /// Unpack a header word. A word that is not a real header may decode to
    /// a size that is not a multiple of [`ALIGNMENT`].
    pub fn decode(word: u32) -> Self {
        BlockHeader {
            size: (word & !FLAG_MASK) as usize,
            allocated: word & ALLOCATED_BIT != 0,
            prev_allocated: word & PREV_ALLOCATED_BIT != 0,
        }
    }

    /// Pack this header into a word.
    ///
    /// Panics if the size is not a multiple of [`ALIGNMENT`] or is larger
    /// than [`MAX_BLOCK_SIZE`]; such a header cannot exist in a valid heap.
    pub fn encode(self) -> u32 {
        assert!(
            self.size % ALIGNMENT == 0 && self.size <= MAX_BLOCK_SIZE,
            "Can't encode a block of size {}",
            self.size
        );

        let mut word = self.size as u32;
        if self.allocated {
            word |= ALLOCATED_BIT;
        }
        if self.prev_allocated {
            word |= PREV_ALLOCATED_BIT;
        }
        word
    }
}

/// Round up value to the nearest multiple of increment.
///
/// Returns `None` on overflow.
pub fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

/// The size of the block needed to hand out `payload` bytes: the payload plus
/// a header, rounded up to [`ALIGNMENT`].
///
/// Returns `None` if that size can't be represented.
pub fn block_size(payload: usize) -> Option<usize> {
    let raw = payload.checked_add(HEADER_SIZE)?;
    round_up(raw, ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_header_word() {
        // Sizes taken from a 24 byte block in each of its four states.
        let cases = [
            (BlockHeader::new(24, true, false), 25),
            (BlockHeader::new(24, true, true), 27),
            (BlockHeader::new(24, false, false), 24),
            (BlockHeader::new(24, false, true), 26),
        ];

        for &(header, word) in cases.iter() {
            assert_eq!(header.encode(), word);
            assert_eq!(BlockHeader::decode(word), header);
        }
    }

    #[test]
    fn test_decode_garbage() {
        let header = BlockHeader::decode(0x2d);
        assert_eq!(header.size, 44);
        assert!(header.allocated);
        assert_ne!(header.size % ALIGNMENT, 0);
    }

    #[test]
    fn test_sentinel_word() {
        let sentinel = BlockHeader::decode(SENTINEL_WORD);
        assert_eq!(sentinel.size, 0);
        assert!(sentinel.allocated);
        assert!(!sentinel.prev_allocated);
    }

    #[test]
    #[should_panic]
    fn test_encode_unaligned() {
        BlockHeader::new(20, false, true).encode();
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(1), Some(8));
        assert_eq!(block_size(4), Some(8));
        assert_eq!(block_size(5), Some(16));
        assert_eq!(block_size(60), Some(64));
        assert_eq!(block_size(61), Some(72));
        assert_eq!(block_size(usize::MAX), None);
        assert_eq!(block_size(usize::MAX - HEADER_SIZE), None);

        for payload in 1..200 {
            let size = block_size(payload).unwrap();
            assert_eq!(size % ALIGNMENT, 0);
            assert!(size - HEADER_SIZE >= payload);
            assert!(size - HEADER_SIZE < payload + ALIGNMENT);
        }
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX, 4096), None);
    }
}
