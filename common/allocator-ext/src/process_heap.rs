use {super::UnalignedAllocator, std::ptr::NonNull};

/// Allocator backed by the C runtime's `malloc`, `realloc`, and `free`.
///
/// This is a zero-sized handle to the process-wide heap.
/// It may be used from any thread concurrently;
/// synchronization is provided by the C runtime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProcessHeap;

// SAFETY: The C runtime upholds the contract.
unsafe impl UnalignedAllocator for ProcessHeap
{
    fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
    {
        // SAFETY: malloc has no preconditions.
        let ptr = unsafe { libc::malloc(byte_count) };
        NonNull::new(ptr.cast())
    }

    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        _preserve_byte_count: usize,
        byte_count: usize,
    ) -> Option<NonNull<u8>>
    {
        // realloc preserves min(old size, byte_count) bytes,
        // which is at least preserve_byte_count.
        let ptr = libc::realloc(ptr.as_ptr().cast(), byte_count);
        NonNull::new(ptr.cast())
    }

    unsafe fn free(&self, ptr: Option<NonNull<u8>>)
    {
        if let Some(ptr) = ptr {
            libc::free(ptr.as_ptr().cast());
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn reallocate_preserves_contents()
    {
        unsafe {
            let ptr = ProcessHeap.try_allocate(4).unwrap();
            ptr.as_ptr().copy_from_nonoverlapping([1, 2, 3, 4].as_ptr(), 4);
            let ptr = ProcessHeap.try_reallocate(ptr, 4, 4096).unwrap();
            assert_eq!(std::slice::from_raw_parts(ptr.as_ptr(), 4), [1, 2, 3, 4]);
            ProcessHeap.free(Some(ptr));
        }
    }

    #[test]
    fn free_none_is_noop()
    {
        unsafe { ProcessHeap.free(None); }
    }
}
