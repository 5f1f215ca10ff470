//! Manual memory management and object lifetime primitives.
//!
//! The crate is layered as follows, leaves first:
//!
//!  - Unaligned and aligned allocation live in the `allocator-ext` crate,
//!    which is re-exported here as [`allocator_ext`].
//!  - [`allocation`] allocates typed buffers from any unaligned allocator.
//!  - [`lifetime`] constructs, copies, moves, and destroys values
//!    in raw storage, and finalizes managed objects.
//!  - [`heap`] defines managed objects and the collector interface,
//!    together with a small collector implementation.
//!  - [`weakref`] observes managed objects without keeping them alive.

#![warn(missing_docs)]

pub use allocator_ext;

pub mod allocation;
pub mod heap;
pub mod lifetime;
pub mod weakref;
