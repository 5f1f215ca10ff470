use {std::ptr::NonNull, thiserror::Error};

/// Returned when an allocation cannot be satisfied.
///
/// This covers both exhaustion of the underlying allocator
/// and arithmetic overflow while computing the size to allocate.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("Cannot allocate memory")]
pub struct AllocationFailure(());

impl AllocationFailure
{
    /// Create an allocation failure.
    pub const fn new() -> Self
    {
        Self(())
    }
}

/// Minimal allocator capability.
///
/// Unaligned allocators allocate, reallocate, and free bytes,
/// with no alignment guarantee beyond the platform default.
/// They never zero or otherwise initialize memory,
/// and they report failure by returning [`None`] rather than panicking.
/// Alignment and initialization are the business of the layers above.
///
/// Any type implementing this trait can be plugged into
/// [`try_raw_allocate`][`crate::try_raw_allocate`] and friends.
///
/// # Safety
///
/// A pointer returned by [`try_allocate`][`Self::try_allocate`]
/// or [`try_reallocate`][`Self::try_reallocate`] must be valid
/// for reads and writes of the requested number of bytes,
/// and must not overlap any other live allocation,
/// until it is passed to [`free`][`Self::free`]
/// or [`try_reallocate`][`Self::try_reallocate`].
pub unsafe trait UnalignedAllocator
{
    /// Allocate `byte_count` bytes of uninitialized memory.
    ///
    /// `byte_count` is never zero.
    fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>;

    /// Resize an allocation to `byte_count` bytes.
    ///
    /// On success the first `preserve_byte_count` bytes are retained,
    /// the old pointer is invalidated, and the new pointer is returned.
    /// On failure the old allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not yet freed.
    /// `preserve_byte_count` must not exceed
    /// the old size nor `byte_count`.
    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        preserve_byte_count: usize,
        byte_count: usize,
    ) -> Option<NonNull<u8>>;

    /// Free an allocation.
    ///
    /// Freeing [`None`] does nothing.
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must have been returned by this allocator
    /// and not yet freed.
    unsafe fn free(&self, ptr: Option<NonNull<u8>>);
}

// SAFETY: Forwards to the referenced allocator.
unsafe impl<A> UnalignedAllocator for &A
    where A: UnalignedAllocator + ?Sized
{
    fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
    {
        (**self).try_allocate(byte_count)
    }

    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        preserve_byte_count: usize,
        byte_count: usize,
    ) -> Option<NonNull<u8>>
    {
        (**self).try_reallocate(ptr, preserve_byte_count, byte_count)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>)
    {
        (**self).free(ptr)
    }
}
