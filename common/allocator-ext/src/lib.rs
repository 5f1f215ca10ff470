//! Extra items for working with allocators.
//!
//! This crate provides the lower layers of manual memory management:
//!
//!  - [Alignment arithmetic][`align`]: pure functions for computing
//!    padding and overflow-checked sizes, and the back-offset byte scheme
//!    that recovers an unaligned address from an aligned one.
//!  - [Unaligned allocators][`UnalignedAllocator`]: the minimal capability
//!    of allocating, reallocating, and freeing bytes.
//!    [`ProcessHeap`] delegates to the C runtime;
//!    [`PlatformHeap`] and [`LocalHeap`] are explicitly created heaps.
//!  - [Aligned allocation][`aligned`]: an alignment-aware layer on top of
//!    any unaligned allocator, handing out owning [`RawBlock`] handles.
//!
//! # Owning handles
//!
//! Every block obtained from the aligned layer is owned by a [`RawBlock`].
//! The handle cannot be copied, and dropping it frees the block.
//! Hence double frees and use-after-free are impossible in safe code.
//! The unaligned layer below works with plain pointers;
//! its entry points that take pointers are unsafe.

#![warn(missing_docs)]

pub use self::{
    align::{Alignment, AlignmentError, MAX_ALIGN},
    aligned::*,
    platform_heap::*,
    process_heap::*,
    unaligned::*,
};

pub mod align;

mod aligned;
mod platform_heap;
mod process_heap;
mod unaligned;
