//! Alignment and size arithmetic.
//!
//! Aligned blocks are obtained from an unaligned allocator
//! by over-allocating and rounding the returned address up.
//! Every aligned allocation reserves a full alignment worth of padding
//! in front of the address handed out to the user.
//! The byte immediately preceding the aligned address
//! stores the distance to the unaligned address, minus one:
//!
//! ```text
//!  raw                         aligned
//!   |<-------- offset -------->|
//!   [ padding ... | offset - 1 ][ user data ... ]
//! ```
//!
//! Because the aligned address is always strictly greater than the raw
//! address, the offset lies in `1 ..= alignment` and the stored byte
//! lies in `0 .. alignment`. With alignments of at most [`MAX_ALIGN`],
//! the stored byte always fits in a `u8`, and no case needs special handling.

use {std::{mem::align_of, ptr::NonNull}, thiserror::Error};

/// The largest supported alignment.
///
/// The back-offset byte must be able to represent `alignment - 1`.
pub const MAX_ALIGN: usize = 256;

/// Power-of-two alignment of at most [`MAX_ALIGN`] bytes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Alignment
{
    // INVARIANT: Power of two, at most MAX_ALIGN.
    inner: usize,
}

/// Returned when creating an unsupported alignment.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum AlignmentError
{
    /// The alignment is not a power of two.
    #[error("Alignment {0} is not a power of two")]
    NotPowerOfTwo(usize),

    /// The alignment exceeds [`MAX_ALIGN`].
    #[error("Alignment {0} exceeds the maximum of 256")]
    TooLarge(usize),
}

impl Alignment
{
    /// The alignment of one byte.
    pub const ONE: Self = Self{inner: 1};

    /// Validate an alignment.
    pub const fn new(alignment: usize) -> Result<Self, AlignmentError>
    {
        if !alignment.is_power_of_two() {
            return Err(AlignmentError::NotPowerOfTwo(alignment));
        }
        if alignment > MAX_ALIGN {
            return Err(AlignmentError::TooLarge(alignment));
        }
        Ok(Self{inner: alignment})
    }

    /// The alignment of `T`.
    ///
    /// # Panics
    ///
    /// If `T` is aligned to more than [`MAX_ALIGN`] bytes.
    pub const fn of<T>() -> Self
    {
        match Self::new(align_of::<T>()) {
            Ok(alignment) => alignment,
            Err(..) => panic!("Type is aligned beyond MAX_ALIGN"),
        }
    }

    /// The alignment in bytes.
    pub const fn get(self) -> usize
    {
        self.inner
    }

    /// Whether `addr` is a multiple of this alignment.
    pub fn is_aligned(self, addr: usize) -> bool
    {
        addr & (self.inner - 1) == 0
    }
}

/// The number of padding bytes reserved in front of an aligned block.
///
/// This is always the alignment itself, so that the back-offset byte
/// never needs a branch to find room for itself.
pub fn padding_for(alignment: Alignment) -> usize
{
    alignment.get()
}

/// Add two sizes, returning [`None`] on overflow.
///
/// Both operands must be nonzero; zero-sized
/// requests are never made by the allocation layers.
pub fn add_checked(lhs: usize, rhs: usize) -> Option<usize>
{
    debug_assert!(lhs != 0 && rhs != 0, "Zero operand in size computation");
    lhs.checked_add(rhs)
}

/// Multiply an element size by a count, returning [`None`] on overflow.
///
/// Both operands must be nonzero; zero-sized
/// requests are never made by the allocation layers.
pub fn mul_checked(element_size: usize, count: usize) -> Option<usize>
{
    debug_assert!(
        element_size != 0 && count != 0,
        "Zero operand in size computation",
    );
    element_size.checked_mul(count)
}

/// Round a raw address up to the next aligned address
/// and record the back-offset byte just before it.
///
/// The returned address is always strictly greater than `raw`,
/// even when `raw` is already aligned.
///
/// # Safety
///
/// `raw` must be valid for writes of at least
/// [`padding_for(alignment)`][`padding_for`] bytes.
pub unsafe fn align_up(raw: NonNull<u8>, alignment: Alignment) -> NonNull<u8>
{
    let align = alignment.get();
    let misalignment = raw.as_ptr() as usize & (align - 1);
    let offset = align - misalignment;

    // SAFETY: offset <= align, which is within the padding.
    let aligned = raw.as_ptr().add(offset);

    // The bias of one lets offsets 1 ..= 256 fit in a byte.
    aligned.sub(1).write((offset - 1) as u8);

    NonNull::new_unchecked(aligned)
}

/// Recover the raw address from an address returned by [`align_up`].
///
/// # Safety
///
/// `aligned` must have been returned by [`align_up`],
/// and the back-offset byte must not have been overwritten.
pub unsafe fn dealign(aligned: NonNull<u8>) -> NonNull<u8>
{
    let offset = back_offset(aligned);
    NonNull::new_unchecked(aligned.as_ptr().sub(offset))
}

/// The distance between an aligned address and its raw address.
///
/// # Safety
///
/// Same as for [`dealign`].
pub unsafe fn back_offset(aligned: NonNull<u8>) -> usize
{
    aligned.as_ptr().sub(1).read() as usize + 1
}
