use std::{mem::size_of, ptr};

/// Copy the bits of the value at `src` to `dest`.
///
/// The source and destination may overlap.
/// Small sizes are copied with two possibly overlapping loads
/// that both complete before either store,
/// instead of going through the general memmove.
///
/// # Safety
///
/// `src` must be valid for reads and `dest` must be valid for writes
/// of one `T`. Both must be aligned for `T`.
/// The value at `dest` is overwritten without being dropped.
#[inline]
pub unsafe fn raw_copy<T>(src: *const T, dest: *mut T)
{
    let s = src.cast::<u8>();
    let d = dest.cast::<u8>();
    match size_of::<T>() {
        0  => { },
        1  => copy_two::<u8, ()>(s, d),
        2  => copy_two::<u16, ()>(s, d),
        3  => copy_two::<u16, u8>(s, d),
        4  => copy_two::<u32, ()>(s, d),
        5  => copy_two::<u32, u8>(s, d),
        6  => copy_two::<u32, u16>(s, d),
        8  => copy_two::<u64, ()>(s, d),
        9  => copy_two::<u64, u8>(s, d),
        10 => copy_two::<u64, u16>(s, d),
        12 => copy_two::<u64, u32>(s, d),
        16 => copy_two::<u64, u64>(s, d),
        _  => ptr::copy(src, dest, 1),
    }
}

/// Like [`raw_copy`], but usable in constant evaluation.
///
/// # Safety
///
/// Same as for [`raw_copy`].
pub const unsafe fn raw_copy_const<T>(src: *const T, dest: *mut T)
{
    ptr::copy(src, dest, 1);
}

/// Copy `size_of::<H>() + size_of::<L>()` bytes.
#[inline(always)]
unsafe fn copy_two<H, L>(src: *const u8, dest: *mut u8)
    where H: Copy, L: Copy
{
    let head = src.cast::<H>().read_unaligned();
    let tail = src.add(size_of::<H>()).cast::<L>().read_unaligned();
    dest.cast::<H>().write_unaligned(head);
    dest.add(size_of::<H>()).cast::<L>().write_unaligned(tail);
}
