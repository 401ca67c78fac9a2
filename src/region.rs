//! Backing memory for a heap.
//!
//! A [`RegionSource`] hands out one contiguous range of bytes and takes it
//! back later. [`MmapSource`] maps anonymous pages from the OS;
//! [`ToyRegion`] carves its range out of an ordinary boxed buffer and is
//! mainly useful for testing.
//!
//! [`Region`] is the acquired range itself, with word accessors that check
//! every offset against the range before touching memory.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;

use thiserror::Error;

use crate::header::{BlockHeader, ALIGNMENT, FIRST_BLOCK, FOOTER_SIZE, SENTINEL_SIZE};

/// Something that can provide the bytes for a heap region.
pub trait RegionSource {
    type Err;

    /// Granularity of regions from this source. Region lengths are rounded up
    /// to a multiple of this, which must itself be a multiple of 8.
    fn page_size(&self) -> usize;

    /// Acquire `len` bytes, where `len` is a multiple of `page_size()`.
    ///
    /// # Safety
    ///
    /// On success, the returned pointer must be aligned to at least 8 bytes,
    /// and the `len` bytes behind it must be readable, writable, and not
    /// accessible by any other code until they are passed back to `release`.
    unsafe fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a range previously returned by `acquire`.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly what a previous call to `acquire`
    /// returned and was asked for, and nothing may use the memory afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize);
}

/// MmapSource uses anonymous memory maps to provide a region.
#[cfg(unix)]
#[derive(Default)]
pub struct MmapSource {
    // Just for tracking, not really needed
    mapped: usize,
}

#[cfg(unix)]
impl MmapSource {
    pub fn new() -> Self {
        MmapSource::default()
    }

    /// Bytes currently mapped through this source.
    pub fn mapped(&self) -> usize {
        self.mapped
    }
}

#[cfg(unix)]
impl RegionSource for MmapSource {
    type Err = errno::Errno;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            // Not backed by a file, and not shared with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        // mmap never hands out the zero page on success.
        let ptr = NonNull::new(ptr as *mut u8).ok_or(errno::Errno(libc::ENOMEM))?;

        self.mapped += len;
        log::debug!("Mapped {} bytes at {:?}", len, ptr);

        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            // Nothing sensible can be done; the pages stay mapped until exit.
            log::warn!("munmap of {:?} failed: {}", ptr, errno::errno());
            return;
        }
        self.mapped -= len;
        log::debug!("Unmapped {} bytes at {:?}", len, ptr);
    }
}

/// Why a `ToyRegion` refused to hand out a region.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ToyRegionError {
    #[error("Requested {requested} bytes from a toy region limited to {limit}")]
    Overflow { requested: usize, limit: usize },
    /// A toy region hands out one buffer at a time.
    #[error("The toy region's buffer is already in use")]
    InUse,
}

/// A region source backed by a boxed buffer, pretending to be the OS.
///
/// The buffer lives on the global heap, so the region stays put even when
/// the `ToyRegion` (or the heap owning it) moves.
pub struct ToyRegion {
    pub page_size: usize,
    pub limit: usize,
    buffer: Option<Box<[u64]>>,
}

impl Default for ToyRegion {
    fn default() -> Self {
        ToyRegion::new(64, 256 * 1024)
    }
}

impl ToyRegion {
    /// A toy region source with the given page size and maximum region size.
    ///
    /// Panics if `page_size` is not a positive multiple of 8.
    pub fn new(page_size: usize, limit: usize) -> Self {
        assert!(
            page_size > 0 && page_size % ALIGNMENT == 0,
            "Page size {} is not a multiple of {}",
            page_size,
            ALIGNMENT
        );
        ToyRegion {
            page_size,
            limit,
            buffer: None,
        }
    }

    /// A toy region source with the given page size and the default limit.
    pub fn with_page_size(page_size: usize) -> Self {
        ToyRegion::new(page_size, ToyRegion::default().limit)
    }

    /// Whether a region is currently handed out.
    pub fn in_use(&self) -> bool {
        self.buffer.is_some()
    }
}

impl RegionSource for ToyRegion {
    type Err = ToyRegionError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn acquire(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        if self.buffer.is_some() {
            return Err(ToyRegionError::InUse);
        }
        if len > self.limit {
            return Err(ToyRegionError::Overflow {
                requested: len,
                limit: self.limit,
            });
        }

        // u64 words keep the buffer 8-byte aligned
        let words = len / core::mem::size_of::<u64>();
        let mut buffer = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::new_unchecked(buffer.as_mut_ptr() as *mut u8);
        self.buffer = Some(buffer);

        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _len: usize) {
        if let Some(buffer) = self.buffer.take() {
            debug_assert_eq!(buffer.as_ptr() as *const u8, ptr.as_ptr() as *const u8);
            drop(buffer);
        }
    }
}

/// An acquired region: a base pointer and a length.
///
/// Offsets given to the accessors are relative to the base. They must be
/// word aligned and in bounds; anything else is a bug in the heap, and
/// panics rather than touching memory outside the region.
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// # Safety
    ///
    /// `base` must point to `len` bytes that this `Region` has exclusive use
    /// of, aligned to at least 8 bytes.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % ALIGNMENT, 0);
        Region { base, len }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Offset of the end marker.
    pub fn sentinel(&self) -> usize {
        self.len - SENTINEL_SIZE
    }

    pub fn is_sentinel(&self, offset: usize) -> bool {
        offset == self.sentinel()
    }

    fn check(&self, offset: usize) {
        let word = core::mem::size_of::<u32>();
        assert!(
            offset % word == 0 && offset <= self.len - word,
            "Offset {} is outside a region of {} bytes",
            offset,
            self.len
        );
    }

    pub fn word(&self, offset: usize) -> u32 {
        self.check(offset);
        // In bounds and aligned, as checked above.
        unsafe { (self.base.as_ptr().add(offset) as *const u32).read() }
    }

    pub fn set_word(&mut self, offset: usize, value: u32) {
        self.check(offset);
        unsafe { (self.base.as_ptr().add(offset) as *mut u32).write(value) }
    }

    pub fn header(&self, offset: usize) -> BlockHeader {
        BlockHeader::decode(self.word(offset))
    }

    pub fn set_header(&mut self, offset: usize, header: BlockHeader) {
        self.set_word(offset, header.encode());
    }

    /// The footer word of the block at `offset` with the given size.
    pub fn footer(&self, offset: usize, size: usize) -> usize {
        self.word(offset + size - FOOTER_SIZE) as usize
    }

    pub fn set_footer(&mut self, offset: usize, size: usize) {
        self.set_word(offset + size - FOOTER_SIZE, size as u32);
    }

    /// Set the `prev_allocated` flag of the block at `offset`, unless that is
    /// the sentinel.
    pub fn set_prev_allocated(&mut self, offset: usize, prev_allocated: bool) {
        if self.is_sentinel(offset) {
            return;
        }
        let mut header = self.header(offset);
        header.prev_allocated = prev_allocated;
        self.set_header(offset, header);
    }

    /// The address of the byte at `offset`.
    pub fn address(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// The offset of `ptr` from the region base, if it lies between the first
    /// block and the sentinel.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset < FIRST_BLOCK || offset >= self.sentinel() {
            return None;
        }
        Some(offset)
    }
}
