//! Weak references to managed objects.
//!
//! A weak reference observes whether an object is still live
//! without keeping it live. It registers a dispose event
//! with the [`Collector`][`crate::heap::Collector`];
//! when the object is finalized, the event clears the reference.
//!
//! Reading a weak reference pins its target for the duration of the read,
//! so a read that observes the target returns a reference
//! that was live at some point during the read.
//! A read racing with finalization may return either outcome.
//!
//! [`WeakReferenceArray`] holds many weak references in one buffer,
//! sharing one dispose event among the slots that refer to the same object.

pub use self::{array::*, weak_reference::*};

use thiserror::Error;

mod array;
mod weak_reference;

/// Returned when creating a weak reference to a finalized object.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("Cannot create weak reference to finalized object")]
pub struct TargetFinalized(());
