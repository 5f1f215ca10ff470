use {
    super::{AllocationFailure, UnalignedAllocator},
    log::debug,
    std::{cell::RefCell, mem::size_of, ptr::NonNull, sync::Mutex},
    thiserror::Error,
};

/// Options for creating a [`PlatformHeap`] or [`LocalHeap`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapOptions
{
    /// The maximum number of bytes handed out at any one time.
    ///
    /// Requests that would exceed this fail.
    /// [`None`] means the heap may grow without bound.
    pub maximum_size: Option<usize>,
}

impl HeapOptions
{
    /// Options for an unbounded heap.
    pub const fn new() -> Self
    {
        Self{maximum_size: None}
    }

    /// Bound the number of bytes handed out at any one time.
    pub const fn maximum_size(mut self, maximum_size: usize) -> Self
    {
        self.maximum_size = Some(maximum_size);
        self
    }
}

/// Returned when a heap cannot be created.
#[derive(Debug, Error)]
pub enum HeapCreateError
{
    /// The options do not describe a usable heap.
    #[error("Maximum heap size must be nonzero")]
    ZeroMaximumSize,

    /// The heap's bookkeeping could not be allocated.
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),
}

/// Explicitly created heap, safe to share between threads.
///
/// Unlike [`ProcessHeap`][`super::ProcessHeap`], this heap keeps track
/// of every block it hands out; dropping the heap frees all of them at once.
/// Operations are serialized by a lock.
/// Use [`LocalHeap`] for a heap owned by a single thread.
pub struct PlatformHeap
{
    blocks: Mutex<Blocks>,
}

/// Explicitly created heap, owned by a single thread.
///
/// This is the unserialized counterpart of [`PlatformHeap`].
/// It takes no locks, and hence cannot be shared between threads;
/// it can still be moved to another thread as a whole.
pub struct LocalHeap
{
    blocks: RefCell<Blocks>,
}

impl PlatformHeap
{
    /// Create a heap with the given options.
    pub fn new(options: HeapOptions) -> Result<Self, HeapCreateError>
    {
        let blocks = Blocks::new(options)?;
        Ok(Self{blocks: Mutex::new(blocks)})
    }

    /// The number of bytes currently handed out.
    pub fn committed(&self) -> usize
    {
        self.blocks.lock().unwrap().committed
    }

    /// The number of blocks currently handed out.
    pub fn block_count(&self) -> usize
    {
        self.blocks.lock().unwrap().count
    }
}

impl LocalHeap
{
    /// Create a heap with the given options.
    pub fn new(options: HeapOptions) -> Result<Self, HeapCreateError>
    {
        let blocks = Blocks::new(options)?;
        Ok(Self{blocks: RefCell::new(blocks)})
    }

    /// The number of bytes currently handed out.
    pub fn committed(&self) -> usize
    {
        self.blocks.borrow().committed
    }

    /// The number of blocks currently handed out.
    pub fn block_count(&self) -> usize
    {
        self.blocks.borrow().count
    }
}

// SAFETY: Blocks upholds the contract; the mutex serializes access.
unsafe impl UnalignedAllocator for PlatformHeap
{
    fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
    {
        self.blocks.lock().unwrap().allocate(byte_count)
    }

    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        _preserve_byte_count: usize,
        byte_count: usize,
    ) -> Option<NonNull<u8>>
    {
        self.blocks.lock().unwrap().reallocate(ptr, byte_count)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>)
    {
        if let Some(ptr) = ptr {
            self.blocks.lock().unwrap().free(ptr);
        }
    }
}

// SAFETY: Blocks upholds the contract; LocalHeap is !Sync.
unsafe impl UnalignedAllocator for LocalHeap
{
    fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
    {
        self.blocks.borrow_mut().allocate(byte_count)
    }

    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        _preserve_byte_count: usize,
        byte_count: usize,
    ) -> Option<NonNull<u8>>
    {
        self.blocks.borrow_mut().reallocate(ptr, byte_count)
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>)
    {
        if let Some(ptr) = ptr {
            self.blocks.borrow_mut().free(ptr);
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                              Block bookkeeping                             */
/* -------------------------------------------------------------------------- */

/// Header in front of every block handed out by a heap.
///
/// The alignment keeps payloads at the alignment `malloc` provides.
#[repr(C, align(16))]
struct BlockHeader
{
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
    size: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Circular doubly linked list of blocks, headed by a sentinel.
struct Blocks
{
    sentinel: NonNull<BlockHeader>,
    committed: usize,
    count: usize,
    maximum_size: Option<usize>,
}

// SAFETY: The blocks are exclusively owned by the list.
unsafe impl Send for Blocks { }

impl Blocks
{
    fn new(options: HeapOptions) -> Result<Self, HeapCreateError>
    {
        if options.maximum_size == Some(0) {
            return Err(HeapCreateError::ZeroMaximumSize);
        }

        // SAFETY: malloc has no preconditions.
        let sentinel = unsafe { libc::malloc(HEADER_SIZE) };
        let sentinel = NonNull::new(sentinel.cast::<BlockHeader>())
            .ok_or(AllocationFailure::new())?;

        let ptr = sentinel.as_ptr();
        // SAFETY: The sentinel is valid for writes.
        unsafe { ptr.write(BlockHeader{prev: ptr, next: ptr, size: 0}); }

        debug!("created heap with maximum size {:?}", options.maximum_size);

        Ok(Self{
            sentinel,
            committed: 0,
            count: 0,
            maximum_size: options.maximum_size,
        })
    }

    /// Whether replacing `old` committed bytes by `new` stays within bounds.
    fn admits(&self, old: usize, new: usize) -> bool
    {
        match self.maximum_size {
            None => true,
            Some(maximum) => (self.committed - old).checked_add(new)
                .map_or(false, |committed| committed <= maximum),
        }
    }

    fn allocate(&mut self, byte_count: usize) -> Option<NonNull<u8>>
    {
        if !self.admits(0, byte_count) {
            return None;
        }

        let total = byte_count.checked_add(HEADER_SIZE)?;

        // SAFETY: malloc has no preconditions.
        let header = unsafe { libc::malloc(total) };
        let header = NonNull::new(header.cast::<BlockHeader>())?;

        // SAFETY: The header is valid for writes and not yet linked.
        unsafe { self.link(header, byte_count); }

        self.committed += byte_count;
        self.count += 1;

        // SAFETY: The header was allocated by this heap.
        Some(unsafe { payload_of(header) })
    }

    /// # Safety
    ///
    /// `ptr` must have been handed out by this heap and not yet freed.
    unsafe fn reallocate(&mut self, ptr: NonNull<u8>, byte_count: usize)
        -> Option<NonNull<u8>>
    {
        let header = header_of(ptr);
        let old_size = (*header.as_ptr()).size;

        if !self.admits(old_size, byte_count) {
            return None;
        }

        let total = byte_count.checked_add(HEADER_SIZE)?;
        let new = libc::realloc(header.as_ptr().cast(), total);
        let new = NonNull::new(new.cast::<BlockHeader>())?;

        // The neighbours still point at the old address.
        let prev = (*new.as_ptr()).prev;
        let next = (*new.as_ptr()).next;
        (*prev).next = new.as_ptr();
        (*next).prev = new.as_ptr();
        (*new.as_ptr()).size = byte_count;

        self.committed = self.committed - old_size + byte_count;

        Some(payload_of(new))
    }

    /// # Safety
    ///
    /// `ptr` must have been handed out by this heap and not yet freed.
    unsafe fn free(&mut self, ptr: NonNull<u8>)
    {
        let header = header_of(ptr);
        self.committed -= (*header.as_ptr()).size;
        self.count -= 1;
        Self::unlink(header);
        libc::free(header.as_ptr().cast());
    }

    /// Insert a fresh block after the sentinel.
    ///
    /// # Safety
    ///
    /// `header` must be valid for writes and not linked into any list.
    unsafe fn link(&mut self, header: NonNull<BlockHeader>, size: usize)
    {
        let sentinel = self.sentinel.as_ptr();
        let next = (*sentinel).next;
        header.as_ptr().write(BlockHeader{prev: sentinel, next, size});
        (*next).prev = header.as_ptr();
        (*sentinel).next = header.as_ptr();
    }

    /// # Safety
    ///
    /// `header` must be linked into a list.
    unsafe fn unlink(header: NonNull<BlockHeader>)
    {
        let prev = (*header.as_ptr()).prev;
        let next = (*header.as_ptr()).next;
        (*prev).next = next;
        (*next).prev = prev;
    }
}

impl Drop for Blocks
{
    fn drop(&mut self)
    {
        debug!(
            "destroying heap with {} blocks, {} bytes outstanding",
            self.count, self.committed,
        );

        let sentinel = self.sentinel.as_ptr();

        // SAFETY: Every linked block is owned by this list.
        unsafe {
            let mut header = (*sentinel).next;
            while header != sentinel {
                let next = (*header).next;
                libc::free(header.cast());
                header = next;
            }
            libc::free(sentinel.cast());
        }
    }
}

/// # Safety
///
/// `header` must head a block allocated by a heap.
unsafe fn payload_of(header: NonNull<BlockHeader>) -> NonNull<u8>
{
    NonNull::new_unchecked(header.as_ptr().add(1).cast())
}

/// # Safety
///
/// `ptr` must have been obtained from [`payload_of`].
unsafe fn header_of(ptr: NonNull<u8>) -> NonNull<BlockHeader>
{
    NonNull::new_unchecked(ptr.as_ptr().cast::<BlockHeader>().sub(1))
}
