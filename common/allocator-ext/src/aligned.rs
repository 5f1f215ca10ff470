//! Aligned allocation on top of unaligned allocators.

use {
    super::{
        AllocationFailure,
        UnalignedAllocator,
        align::{
            Alignment,
            add_checked,
            align_up,
            back_offset,
            dealign,
            mul_checked,
            padding_for,
        },
    },
    log::{trace, warn},
    std::{
        alloc::{Layout, handle_alloc_error},
        fmt,
        mem::{ManuallyDrop, size_of},
        ptr::{self, NonNull},
    },
};

/// Alignment and element size of an array.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ArrayLayout
{
    // INVARIANT: element_size is a nonzero multiple of alignment.
    alignment: Alignment,
    element_size: usize,
}

impl ArrayLayout
{
    /// Create an array layout.
    ///
    /// # Panics
    ///
    /// If `element_size` is zero or not a multiple of `alignment`.
    pub fn new(alignment: Alignment, element_size: usize) -> Self
    {
        assert!(element_size != 0, "Element size must be nonzero");
        assert!(
            element_size % alignment.get() == 0,
            "Element size must be a multiple of the alignment",
        );
        Self{alignment, element_size}
    }

    /// The layout of an array of `T`.
    ///
    /// # Panics
    ///
    /// If `T` is zero-sized or aligned beyond [`MAX_ALIGN`].
    ///
    /// [`MAX_ALIGN`]: `super::MAX_ALIGN`
    pub fn of<T>() -> Self
    {
        Self::new(Alignment::of::<T>(), size_of::<T>())
    }

    /// The alignment of the array.
    pub fn alignment(self) -> Alignment
    {
        self.alignment
    }

    /// The size of each element.
    pub fn element_size(self) -> usize
    {
        self.element_size
    }

    /// The number of bytes of user data for `count` elements.
    pub fn byte_count(self, count: usize) -> Option<usize>
    {
        mul_checked(self.element_size, count)
    }

    /// The number of bytes to request from the unaligned allocator.
    pub fn total_byte_count(self, count: usize) -> Option<usize>
    {
        add_checked(self.byte_count(count)?, padding_for(self.alignment))
    }

    /// Best-effort [`Layout`] for reporting allocation failures.
    fn failure_layout(self, count: usize) -> Layout
    {
        let align = self.alignment.get();
        let size = self.element_size.saturating_mul(count)
            .min(isize::MAX as usize - (align - 1));
        Layout::from_size_align(size, align)
            .unwrap_or_else(|_| Layout::new::<u8>())
    }
}

/// Owning handle to an aligned block.
///
/// The block holds `count` elements laid out according to an [`ArrayLayout`].
/// The handle cannot be copied; dropping it frees the block.
/// The handle never reads or drops the elements in the block;
/// their initialization state is the business of the caller.
pub struct RawBlock<'a, A>
    where A: UnalignedAllocator + ?Sized
{
    allocator: &'a A,

    // INVARIANT: Returned by align_up on memory from allocator.
    ptr: NonNull<u8>,

    layout: ArrayLayout,

    // INVARIANT: Nonzero.
    count: usize,
}

// SAFETY: The handle owns the block, like a Box.
unsafe impl<'a, A> Send for RawBlock<'a, A>
    where A: UnalignedAllocator + Sync + ?Sized { }
unsafe impl<'a, A> Sync for RawBlock<'a, A>
    where A: UnalignedAllocator + Sync + ?Sized { }

/// Attempt to allocate an aligned block for `count` elements.
///
/// If `zero_fill` is set, the user data is zeroed;
/// the padding in front of it is never touched.
/// Fails without side effects if the size computation overflows
/// or if the underlying allocator fails.
///
/// # Panics
///
/// If `count` is zero.
pub fn try_raw_allocate<'a, A>(
    allocator: &'a A,
    layout: ArrayLayout,
    count: usize,
    zero_fill: bool,
) -> Result<RawBlock<'a, A>, AllocationFailure>
    where A: UnalignedAllocator + ?Sized
{
    assert!(count != 0, "Cannot allocate zero elements");

    let failure = || {
        warn!("cannot allocate {count} elements of {layout:?}");
        AllocationFailure::new()
    };

    let byte_count = layout.byte_count(count).ok_or_else(failure)?;
    let total = layout.total_byte_count(count).ok_or_else(failure)?;
    let raw = allocator.try_allocate(total).ok_or_else(failure)?;

    // SAFETY: raw is valid for total bytes, which includes the padding.
    let ptr = unsafe { align_up(raw, layout.alignment) };

    if zero_fill {
        // SAFETY: The user data is byte_count bytes from ptr.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, byte_count); }
    }

    trace!("allocated {total} bytes at {raw:p}, aligned to {ptr:p}");

    Ok(RawBlock{allocator, ptr, layout, count})
}

/// Like [`try_raw_allocate`], but calls the out-of-memory handler on failure.
pub fn raw_allocate<'a, A>(
    allocator: &'a A,
    layout: ArrayLayout,
    count: usize,
    zero_fill: bool,
) -> RawBlock<'a, A>
    where A: UnalignedAllocator + ?Sized
{
    try_raw_allocate(allocator, layout, count, zero_fill)
        .unwrap_or_else(|_| handle_alloc_error(layout.failure_layout(count)))
}

/// Attempt to reallocate an optional block.
///
/// If `block` is [`None`], this behaves like [`try_raw_allocate`]
/// and stores the new block in `block`.
/// Otherwise it behaves like [`RawBlock::try_reallocate`].
/// On failure `block` is left untouched.
pub fn try_raw_reallocate<'a, A>(
    allocator: &'a A,
    block: &mut Option<RawBlock<'a, A>>,
    layout: ArrayLayout,
    preserve_count: usize,
    new_count: usize,
    zero_fill: bool,
) -> Result<(), AllocationFailure>
    where A: UnalignedAllocator + ?Sized
{
    match block {
        Some(block) =>
            block.try_reallocate(preserve_count, new_count, zero_fill),
        None => {
            let new = try_raw_allocate(allocator, layout, new_count, zero_fill)?;
            *block = Some(new);
            Ok(())
        },
    }
}

/// Like [`try_raw_reallocate`], but calls
/// the out-of-memory handler on failure.
pub fn raw_reallocate<'a, A>(
    allocator: &'a A,
    block: &mut Option<RawBlock<'a, A>>,
    layout: ArrayLayout,
    preserve_count: usize,
    new_count: usize,
    zero_fill: bool,
) where A: UnalignedAllocator + ?Sized
{
    let result = try_raw_reallocate(
        allocator, block, layout, preserve_count, new_count, zero_fill);
    if result.is_err() {
        handle_alloc_error(layout.failure_layout(new_count));
    }
}

/// Free an optional block.
///
/// Freeing [`None`] does nothing.
pub fn raw_free<A>(block: Option<RawBlock<'_, A>>)
    where A: UnalignedAllocator + ?Sized
{
    drop(block);
}

impl<'a, A> RawBlock<'a, A>
    where A: UnalignedAllocator + ?Sized
{
    /// Attempt to resize the block to `new_count` elements.
    ///
    /// The first `preserve_count` elements are retained.
    /// If `zero_fill` is set and the block grows,
    /// the bytes of elements `preserve_count .. new_count` are zeroed.
    /// On failure the block is left untouched.
    ///
    /// # Panics
    ///
    /// If `new_count` is zero, or if `preserve_count`
    /// exceeds either the old or the new count.
    pub fn try_reallocate(
        &mut self,
        preserve_count: usize,
        new_count: usize,
        zero_fill: bool,
    ) -> Result<(), AllocationFailure>
    {
        assert!(new_count != 0, "Cannot reallocate to zero elements");
        assert!(
            preserve_count <= self.count && preserve_count <= new_count,
            "Cannot preserve more elements than exist",
        );

        let layout = self.layout;
        let failure = || {
            warn!("cannot reallocate to {new_count} elements of {layout:?}");
            AllocationFailure::new()
        };

        let new_byte_count = layout.byte_count(new_count).ok_or_else(failure)?;
        let new_total = layout.total_byte_count(new_count).ok_or_else(failure)?;

        // The element counts of existing blocks never overflow.
        let preserve_byte_count = layout.element_size * preserve_count;

        // SAFETY: self.ptr was returned by align_up.
        let old_offset = unsafe { back_offset(self.ptr) };
        let raw = unsafe { dealign(self.ptr) };

        // The preserved data ends old_offset + preserve_byte_count bytes in.
        let new_raw = unsafe {
            self.allocator.try_reallocate(
                raw,
                old_offset + preserve_byte_count,
                new_total,
            )
        }.ok_or_else(failure)?;

        // The relative offset need not survive the move,
        // so realign and shift the preserved data if needed.
        // SAFETY: new_raw is valid for new_total bytes.
        let new_ptr = unsafe {
            let new_ptr = align_up_preserving(
                new_raw,
                layout.alignment,
                old_offset,
                preserve_byte_count,
            );
            if zero_fill && new_byte_count > preserve_byte_count {
                ptr::write_bytes(
                    new_ptr.as_ptr().add(preserve_byte_count),
                    0,
                    new_byte_count - preserve_byte_count,
                );
            }
            new_ptr
        };

        trace!(
            "reallocated {:p} to {new_total} bytes at {new_raw:p}, \
             aligned to {new_ptr:p}",
            self.ptr,
        );

        self.ptr = new_ptr;
        self.count = new_count;
        Ok(())
    }

    /// Like [`try_reallocate`][`Self::try_reallocate`],
    /// but calls the out-of-memory handler on failure.
    pub fn reallocate(
        &mut self,
        preserve_count: usize,
        new_count: usize,
        zero_fill: bool,
    )
    {
        if self.try_reallocate(preserve_count, new_count, zero_fill).is_err() {
            handle_alloc_error(self.layout.failure_layout(new_count));
        }
    }

    /// The allocator that owns the block.
    pub fn allocator(&self) -> &'a A
    {
        self.allocator
    }

    /// The layout of the elements.
    pub fn layout(&self) -> ArrayLayout
    {
        self.layout
    }

    /// The number of elements the block has room for.
    pub fn count(&self) -> usize
    {
        self.count
    }

    /// The number of bytes of user data.
    pub fn byte_count(&self) -> usize
    {
        // Existing blocks never overflow.
        self.layout.element_size * self.count
    }

    /// Pointer to the first element.
    pub fn as_ptr(&self) -> NonNull<u8>
    {
        self.ptr
    }

    /// Give up ownership of the block without freeing it.
    ///
    /// The block can be reclaimed with [`from_raw`][`Self::from_raw`].
    pub fn into_raw(self) -> NonNull<u8>
    {
        let this = ManuallyDrop::new(self);
        this.ptr
    }

    /// Reclaim ownership of a block given up by [`into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`into_raw`] on a block
    /// with the given allocator, layout, and count,
    /// and must not have been reclaimed before.
    ///
    /// [`into_raw`]: `Self::into_raw`
    pub unsafe fn from_raw(
        allocator: &'a A,
        ptr: NonNull<u8>,
        layout: ArrayLayout,
        count: usize,
    ) -> Self
    {
        Self{allocator, ptr, layout, count}
    }
}

impl<'a, A> Drop for RawBlock<'a, A>
    where A: UnalignedAllocator + ?Sized
{
    fn drop(&mut self)
    {
        trace!("freeing block aligned at {:p}", self.ptr);
        // SAFETY: self.ptr was returned by align_up on this allocator.
        unsafe {
            let raw = dealign(self.ptr);
            self.allocator.free(Some(raw));
        }
    }
}

impl<'a, A> fmt::Debug for RawBlock<'a, A>
    where A: UnalignedAllocator + ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("RawBlock")
            .field("ptr", &self.ptr)
            .field("layout", &self.layout)
            .field("count", &self.count)
            .finish()
    }
}

/// Realign a reallocated block whose data sits at `old_offset`.
///
/// # Safety
///
/// `raw` must be valid for `padding_for(alignment) + preserve_byte_count`
/// bytes, and hold the preserved data at `old_offset`.
unsafe fn align_up_preserving(
    raw: NonNull<u8>,
    alignment: Alignment,
    old_offset: usize,
    preserve_byte_count: usize,
) -> NonNull<u8>
{
    let old_data = raw.as_ptr().add(old_offset);
    let misalignment = raw.as_ptr() as usize & (alignment.get() - 1);
    let new_offset = alignment.get() - misalignment;
    if new_offset != old_offset {
        // The old and new data may overlap.
        ptr::copy(old_data, raw.as_ptr().add(new_offset), preserve_byte_count);
    }
    // Written last, because the old data may cover the back-offset byte.
    align_up(raw, alignment)
}
