//! Managed objects and the collector interface.
//!
//! Weak references need only a small set of services from a collector,
//! described by the [`Collector`] trait: per-object dispose events
//! temporary roots, and roots that only hold off collection. [`Heap`] is a collector that manages
//! [`Instance`]s and finalizes them when asked to.

pub use self::{
    collector::*,
    heap::*,
    instance::*,
    pinned_root::*,
    reference::*,
};

mod collector;
mod heap;
mod instance;
mod pinned_root;
mod reference;
