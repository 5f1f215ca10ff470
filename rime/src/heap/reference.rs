use {
    super::{Gc, Heap, ObjectId, PinnedRoot},
    crate::lifetime::Hooks,
    std::fmt,
};

/// Value that refers to a managed object.
///
/// Weak references store such values and observe the object
/// they refer to, as given by [`object`][`Self::object`].
///
/// # Safety
///
/// [`object`][`Self::object`] must return an object managed by `C`
/// whose storage remains valid for as long as `C` does.
pub unsafe trait Reference<C>: Copy
    where C: ?Sized
{
    /// The object this value refers to.
    fn object(&self) -> ObjectId;
}

// SAFETY: The heap frees its objects only when it is dropped.
unsafe impl<'h, X> Reference<Heap<'h>> for Gc<'h, X>
{
    fn object(&self) -> ObjectId
    {
        self.id()
    }
}

/// Method bound to a managed object.
pub struct Delegate<'h, X, R>
{
    object: Gc<'h, X>,
    method: fn(&X) -> R,
}

impl<'h, X, R> Delegate<'h, X, R>
{
    /// Bind a method to an object.
    pub fn new(object: Gc<'h, X>, method: fn(&X) -> R) -> Self
    {
        Self{object, method}
    }

    /// The object the method is bound to.
    pub fn target(&self) -> Gc<'h, X>
    {
        self.object
    }

    /// Call the method, unless the object was finalized.
    pub fn call(&self) -> Option<R>
    {
        let pinned = PinnedRoot::new(self.object)?;
        Some((self.method)(&pinned))
    }
}

impl<'h, X, R> Clone for Delegate<'h, X, R>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<'h, X, R> Copy for Delegate<'h, X, R>
{
}

impl<'h, X, R> PartialEq for Delegate<'h, X, R>
{
    fn eq(&self, other: &Self) -> bool
    {
        self.object == other.object
            && self.method as usize == other.method as usize
    }
}

impl<'h, X, R> Eq for Delegate<'h, X, R>
{
}

impl<'h, X, R> fmt::Debug for Delegate<'h, X, R>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Delegate")
            .field("object", &self.object)
            .field("method", &(self.method as usize as *const ()))
            .finish()
    }
}

// SAFETY: Same as for Gc.
unsafe impl<'h, X, R> Reference<Heap<'h>> for Delegate<'h, X, R>
{
    fn object(&self) -> ObjectId
    {
        self.object.id()
    }
}

// SAFETY: References own nothing.
unsafe impl<'h, X> Hooks for Gc<'h, X> { }
unsafe impl<'h, X, R> Hooks for Delegate<'h, X, R> { }
