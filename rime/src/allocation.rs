//! Typed allocation.
//!
//! A [`Buffer`] is an owning (pointer, length) view of an array of `T`
//! obtained from an [`UnalignedAllocator`] through the aligned adaptor.
//! Elements are initialized to `T::default()` one by one
//! rather than by zeroing memory, since a default value
//! need not consist of zero bytes.
//!
//! Buffers never run element destructors.
//! Freeing or dropping a buffer releases its memory only;
//! destroying the elements first is the business of the caller,
//! for instance with [`destruct_in_place`][`crate::lifetime::destruct_in_place`].

use {
    crate::lifetime::reset_to_default,
    allocator_ext::{
        AllocationFailure,
        ArrayLayout,
        ProcessHeap,
        RawBlock,
        UnalignedAllocator,
        raw_free,
        try_raw_reallocate,
    },
    std::{
        alloc::{Layout, handle_alloc_error},
        fmt,
        marker::PhantomData,
        mem::{MaybeUninit, size_of},
        ptr::NonNull,
        slice,
    },
};

/// Owning view of an array of `T`.
pub struct Buffer<'a, T, A = ProcessHeap>
    where A: UnalignedAllocator + ?Sized
{
    allocator: &'a A,

    // INVARIANT: None if len is zero or T is zero-sized.
    //            Otherwise holds exactly len elements.
    block: Option<RawBlock<'a, A>>,

    len: usize,

    // INVARIANT: Elements 0 .. initialized are initialized.
    //            initialized <= len.
    initialized: usize,

    _element: PhantomData<T>,
}

impl<'a, T, A> Buffer<'a, T, A>
    where A: UnalignedAllocator + ?Sized
{
    /// Create an empty buffer.
    ///
    /// This does not call the allocator.
    pub fn new(allocator: &'a A) -> Self
    {
        Self{allocator, block: None, len: 0, initialized: 0, _element: PhantomData}
    }

    /// The allocator that owns the buffer's memory.
    pub fn allocator(&self) -> &'a A
    {
        self.allocator
    }

    /// The number of elements in the buffer.
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// Whether every element of the buffer is initialized.
    pub fn is_initialized(&self) -> bool
    {
        self.initialized == self.len
    }

    /// Pointer to the first element.
    ///
    /// The pointer is dangling if the buffer owns no memory.
    pub fn as_ptr(&self) -> *const T
    {
        self.data().as_ptr()
    }

    /// Pointer to the first element.
    ///
    /// The pointer is dangling if the buffer owns no memory.
    pub fn as_mut_ptr(&mut self) -> *mut T
    {
        self.data().as_ptr()
    }

    fn data(&self) -> NonNull<T>
    {
        match &self.block {
            Some(block) => block.as_ptr().cast(),
            None => NonNull::dangling(),
        }
    }

    /// The elements, if they are all initialized.
    pub fn as_slice(&self) -> Option<&[T]>
    {
        if !self.is_initialized() {
            return None;
        }
        // SAFETY: All len elements are initialized.
        Some(unsafe { slice::from_raw_parts(self.as_ptr(), self.len) })
    }

    /// The elements, if they are all initialized.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]>
    {
        if !self.is_initialized() {
            return None;
        }
        // SAFETY: All len elements are initialized.
        Some(unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) })
    }

    /// The elements, whether initialized or not.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<T>]
    {
        // SAFETY: MaybeUninit has no validity requirements.
        unsafe { slice::from_raw_parts(self.as_ptr().cast(), self.len) }
    }

    /// The elements, whether initialized or not.
    ///
    /// # Safety
    ///
    /// The caller must not uninitialize elements
    /// that the buffer considers initialized.
    pub unsafe fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<T>]
    {
        slice::from_raw_parts_mut(self.as_mut_ptr().cast(), self.len)
    }

    /// Declare every element of the buffer initialized.
    ///
    /// # Safety
    ///
    /// Every element must actually be initialized.
    pub unsafe fn assume_init(&mut self)
    {
        self.initialized = self.len;
    }

    /// Give up the underlying block without freeing it.
    ///
    /// Returns [`None`] if the buffer owns no memory.
    pub fn into_raw_block(self) -> Option<RawBlock<'a, A>>
    {
        self.block
    }

    /// Write default values to elements `from .. self.len`.
    fn initialize_from(&mut self, from: usize)
        where T: Default
    {
        let data = self.as_mut_ptr();
        for i in from .. self.len {
            // SAFETY: i < len, so the element is within the buffer.
            unsafe { reset_to_default(data.add(i)); }
            if self.initialized == i {
                self.initialized = i + 1;
            }
        }
    }
}

impl<'a, T, A> fmt::Debug for Buffer<'a, T, A>
    where T: fmt::Debug, A: UnalignedAllocator + ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self.as_slice() {
            Some(elements) => f.debug_list().entries(elements).finish(),
            None => f.debug_struct("Buffer")
                .field("len", &self.len)
                .field("initialized", &self.initialized)
                .finish(),
        }
    }
}

fn is_zero_sized<T>() -> bool
{
    size_of::<T>() == 0
}

/// Attempt to allocate a buffer of `count` elements.
///
/// If `initialize` is set, every element is set to `T::default()`.
/// Allocating zero elements, or elements of a zero-sized type,
/// does not call the allocator.
///
/// # Panics
///
/// If `T` is aligned beyond [`MAX_ALIGN`][`allocator_ext::MAX_ALIGN`].
pub fn try_allocate<'a, T, A>(
    allocator: &'a A,
    count: usize,
    initialize: bool,
) -> Result<Buffer<'a, T, A>, AllocationFailure>
    where T: Default, A: UnalignedAllocator + ?Sized
{
    let mut buffer = Buffer::new(allocator);
    try_reallocate(&mut buffer, count, initialize)?;
    Ok(buffer)
}

/// Like [`try_allocate`], but calls the out-of-memory handler on failure.
pub fn allocate<'a, T, A>(
    allocator: &'a A,
    count: usize,
    initialize: bool,
) -> Buffer<'a, T, A>
    where T: Default, A: UnalignedAllocator + ?Sized
{
    try_allocate(allocator, count, initialize)
        .unwrap_or_else(|_| handle_alloc_error(failure_layout::<T>(count)))
}

/// Attempt to resize a buffer to `new_count` elements.
///
/// The first `min(buffer.len(), new_count)` elements are retained.
/// If `initialize` is set, elements beyond the old length
/// are set to `T::default()`; retained elements are never touched.
/// Elements cut off by shrinking are not destroyed.
/// Resizing to zero elements frees the buffer.
/// On failure the buffer is left untouched.
pub fn try_reallocate<T, A>(
    buffer: &mut Buffer<'_, T, A>,
    new_count: usize,
    initialize: bool,
) -> Result<(), AllocationFailure>
    where T: Default, A: UnalignedAllocator + ?Sized
{
    if new_count == 0 {
        free(buffer);
        return Ok(());
    }

    if !is_zero_sized::<T>() {
        let layout = ArrayLayout::of::<T>();
        let preserve_count = buffer.len.min(new_count);
        try_raw_reallocate(
            buffer.allocator,
            &mut buffer.block,
            layout,
            preserve_count,
            new_count,
            false,
        )?;
    }

    let old_len = buffer.len;
    buffer.len = new_count;
    buffer.initialized = buffer.initialized.min(new_count);

    if initialize && new_count > old_len {
        buffer.initialize_from(old_len);
    }

    Ok(())
}

/// Like [`try_reallocate`], but calls the out-of-memory handler on failure.
pub fn reallocate<T, A>(
    buffer: &mut Buffer<'_, T, A>,
    new_count: usize,
    initialize: bool,
) where T: Default, A: UnalignedAllocator + ?Sized
{
    if try_reallocate(buffer, new_count, initialize).is_err() {
        handle_alloc_error(failure_layout::<T>(new_count));
    }
}

/// Free a buffer, leaving it empty.
///
/// Freeing an empty buffer does not call the allocator,
/// so freeing twice in a row is harmless.
pub fn free<T, A>(buffer: &mut Buffer<'_, T, A>)
    where A: UnalignedAllocator + ?Sized
{
    raw_free(buffer.block.take());
    buffer.len = 0;
    buffer.initialized = 0;
}

fn failure_layout<T>(count: usize) -> Layout
{
    Layout::array::<T>(count).unwrap_or_else(|_| Layout::new::<T>())
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        proptest::{self as p, proptest},
        std::{cell::Cell, ptr},
    };

    /// Process heap that counts calls.
    #[derive(Default)]
    struct Counting
    {
        calls: Cell<usize>,
    }

    unsafe impl UnalignedAllocator for Counting
    {
        fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
        {
            self.calls.set(self.calls.get() + 1);
            ProcessHeap.try_allocate(byte_count)
        }

        unsafe fn try_reallocate(
            &self,
            ptr: NonNull<u8>,
            preserve_byte_count: usize,
            byte_count: usize,
        ) -> Option<NonNull<u8>>
        {
            self.calls.set(self.calls.get() + 1);
            ProcessHeap.try_reallocate(ptr, preserve_byte_count, byte_count)
        }

        unsafe fn free(&self, ptr: Option<NonNull<u8>>)
        {
            self.calls.set(self.calls.get() + 1);
            ProcessHeap.free(ptr)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Sample
    {
        a: i32,
        b: *const i32,
    }

    impl Default for Sample
    {
        fn default() -> Self
        {
            Self{a: 7, b: ptr::null()}
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(align(64))]
    struct Wide(u64);

    impl Default for Wide
    {
        fn default() -> Self
        {
            Self(0xDEAD_BEEF)
        }
    }

    #[test]
    fn allocated_elements_hold_default_values()
    {
        let allocator = Counting::default();
        let mut buffer = allocate::<Sample, _>(&allocator, 4, true);
        let expected = Sample{a: 7, b: ptr::null()};
        assert_eq!(buffer.as_slice(), Some(&[expected; 4][..]));

        free(&mut buffer);
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice(), Some(&[][..]));

        let calls = allocator.calls.get();
        free(&mut buffer);
        assert_eq!(allocator.calls.get(), calls);
    }

    #[test]
    fn uninitialized_buffers_are_not_readable()
    {
        let mut buffer = allocate::<Sample, _>(&ProcessHeap, 3, false);
        assert_eq!(buffer.as_slice(), None);
        for slot in unsafe { buffer.as_uninit_slice_mut() } {
            slot.write(Sample{a: 1, b: ptr::null()});
        }
        unsafe { buffer.assume_init(); }
        assert!(buffer.as_slice().unwrap().iter().all(|s| s.a == 1));
    }

    #[test]
    fn empty_and_zero_sized_requests_do_not_allocate()
    {
        let allocator = Counting::default();
        let buffer = allocate::<Sample, _>(&allocator, 0, true);
        assert!(buffer.is_empty());
        let mut units = allocate::<(), _>(&allocator, 1000, true);
        assert_eq!(units.len(), 1000);
        reallocate(&mut units, 5, true);
        assert_eq!(units.as_slice().map(<[()]>::len), Some(5));
        assert_eq!(allocator.calls.get(), 0);
    }

    #[test]
    fn overflowing_requests_fail_without_allocating()
    {
        let allocator = Counting::default();
        let result = try_allocate::<u64, _>(&allocator, usize::MAX / 2, true);
        assert!(result.is_err());
        assert_eq!(allocator.calls.get(), 0);
    }

    #[test]
    fn failed_reallocation_keeps_buffer()
    {
        let mut buffer = allocate::<u32, _>(&ProcessHeap, 2, true);
        buffer.as_mut_slice().unwrap()[1] = 5;
        let result = try_reallocate(&mut buffer, usize::MAX / 2, true);
        assert!(result.is_err());
        assert_eq!(buffer.as_slice(), Some(&[0, 5][..]));
    }

    #[test]
    fn reallocating_to_zero_frees()
    {
        let allocator = Counting::default();
        let mut buffer = allocate::<u16, _>(&allocator, 8, true);
        reallocate(&mut buffer, 0, true);
        assert!(buffer.is_empty());
        assert!(buffer.into_raw_block().is_none());
        assert_eq!(allocator.calls.get(), 2);
    }

    #[test]
    fn overaligned_elements_are_aligned()
    {
        let mut buffer = allocate::<Wide, _>(&ProcessHeap, 3, true);
        assert_eq!(buffer.as_ptr() as usize % 64, 0);
        reallocate(&mut buffer, 40, true);
        assert_eq!(buffer.as_ptr() as usize % 64, 0);
        assert!(buffer.as_slice().unwrap().iter().all(|w| w.0 == 0xDEAD_BEEF));
    }

    proptest!
    {
        #[test]
        fn growth_preserves_and_initializes(
            old in 1usize .. 64,
            new in 1usize .. 256,
            values in p::collection::vec(p::num::i32::ANY, 64),
        )
        {
            let mut buffer = allocate::<Sample, _>(&ProcessHeap, old, true);
            for (slot, &a) in buffer.as_mut_slice().unwrap().iter_mut().zip(&values) {
                slot.a = a;
            }

            reallocate(&mut buffer, new, true);

            let elements = buffer.as_slice().unwrap();
            assert_eq!(elements.len(), new);
            for (i, element) in elements.iter().enumerate() {
                if i < old {
                    assert_eq!(element.a, values[i]);
                } else {
                    assert_eq!(*element, Sample::default());
                }
            }
        }
    }
}
