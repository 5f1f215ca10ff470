use {super::{Gc, Instance}, std::{fmt, ops::Deref}};

/// Temporary root to a managed object.
///
/// A pinned root ensures the object won't be finalized,
/// which makes it safe to access the object's value.
/// Explicit finalization waits for pinned objects,
/// and collections skip them.
pub struct PinnedRoot<'h, C>
{
    // INVARIANT: The instance has a temporary root owned by this.
    instance: &'h Instance<C>,
}

impl<'h, C> PinnedRoot<'h, C>
{
    /// Pin the object, unless it is being or has been finalized.
    pub fn new(object: Gc<'h, C>) -> Option<Self>
    {
        let instance = object.instance();
        // Constructed only on success, since dropping it removes the root.
        instance.header().add_temporary_root().then(|| Self{instance})
    }

    /// Unpinned reference to the same object.
    pub fn gc(&self) -> Gc<'h, C>
    {
        Gc::from_instance(self.instance)
    }
}

impl<'h, C> Clone for PinnedRoot<'h, C>
{
    fn clone(&self) -> Self
    {
        // A pinned object is live, so pinning it again succeeds.
        let ok = self.instance.header().add_temporary_root();
        debug_assert!(ok, "Pinned object is not live");
        Self{instance: self.instance}
    }
}

impl<'h, C> Deref for PinnedRoot<'h, C>
{
    type Target = C;

    fn deref(&self) -> &C
    {
        // SAFETY: The object is pinned, so it is live.
        unsafe { (*self.instance.value_ptr()).assume_init_ref() }
    }
}

impl<'h, C> Drop for PinnedRoot<'h, C>
{
    fn drop(&mut self)
    {
        self.instance.header().remove_temporary_root();
    }
}

impl<'h, C> fmt::Debug for PinnedRoot<'h, C>
    where C: fmt::Debug
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(&**self, f)
    }
}
