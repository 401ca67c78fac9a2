use thiserror::Error;

/// Why a heap could not be initialized.
///
/// `E` is the error type of the heap's [`RegionSource`](crate::RegionSource).
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum InitError<E> {
    #[error("Capacity must be positive and fit in a single region")]
    InvalidCapacity,
    #[error("The heap already holds a region")]
    AlreadyInitialized,
    #[error("Could not acquire a heap region: {0}")]
    Resource(E),
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("Requested size must be positive")]
    InvalidSize,
    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },
}

/// Why a pointer was refused by `deallocate`. The heap is never modified
/// when one of these is returned.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum FreeError {
    #[error("Null pointer")]
    NullPointer,
    #[error("Pointer does not address an aligned block")]
    Misaligned,
    #[error("Pointer is outside the heap region")]
    OutOfBounds,
    #[error("Block is already free")]
    DoubleFree,
}
