use {super::Header, std::{fmt, ptr::NonNull}};

/// Identity of a managed object.
///
/// Two references to the same object have the same identity.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(NonNull<Header>);

// SAFETY: Object identities are only dereferenced
//         by the collector that owns the object.
unsafe impl Send for ObjectId { }
unsafe impl Sync for ObjectId { }

impl ObjectId
{
    pub (super) fn new(header: &Header) -> Self
    {
        Self(NonNull::from(header))
    }

    /// The header of the object.
    ///
    /// # Safety
    ///
    /// The object's storage must not have been freed.
    pub (super) unsafe fn header<'a>(self) -> &'a Header
    {
        self.0.as_ref()
    }
}

impl fmt::Debug for ObjectId
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "ObjectId({:p})", self.0)
    }
}

/// Callback invoked when an object is finalized.
///
/// The handler receives the context pointer and
/// the identity of the object being finalized.
/// Events are identified by their context alone,
/// which must be unique among the registrations for an object.
/// Handlers are not compared, since the address of a function
/// is not guaranteed to be the same everywhere it is taken.
#[derive(Clone, Copy, Debug)]
pub struct DisposeEvent
{
    handler: unsafe fn(*const (), ObjectId),
    context: *const (),
}

// SAFETY: The handler is responsible for the context's thread safety.
unsafe impl Send for DisposeEvent { }
unsafe impl Sync for DisposeEvent { }

impl PartialEq for DisposeEvent
{
    fn eq(&self, other: &Self) -> bool
    {
        self.context == other.context
    }
}

impl Eq for DisposeEvent { }

impl DisposeEvent
{
    /// Create a dispose event.
    pub fn new(handler: unsafe fn(*const (), ObjectId), context: *const ())
        -> Self
    {
        Self{handler, context}
    }

    /// Invoke the handler.
    ///
    /// # Safety
    ///
    /// The context must still be valid for the handler.
    pub (super) unsafe fn invoke(self, object: ObjectId)
    {
        (self.handler)(self.context, object);
    }
}

/// Services that a garbage collector offers to weak references.
///
/// # Safety
///
/// Implementations must uphold the following, for each object:
///
///  - While the object has a temporary root, it is not finalized.
///  - While the object has a root, it is not collected,
///    though the program may still finalize it explicitly.
///  - [`add_temporary_root`] and [`add_root`]
///    fail once finalization has started.
///  - [`register_finalization_callback`] fails once finalization
///    has started, in which case the event is never invoked.
///  - Each registered event is invoked exactly once, during finalization,
///    unless it is deregistered first.
///  - [`deregister_finalization_callback`] does not return while
///    the object's events are being invoked, and after it returns
///    the deregistered event is never invoked.
///
/// [`add_temporary_root`]: `Self::add_temporary_root`
/// [`add_root`]: `Self::add_root`
/// [`register_finalization_callback`]: `Self::register_finalization_callback`
/// [`deregister_finalization_callback`]: `Self::deregister_finalization_callback`
pub unsafe trait Collector: Sync
{
    /// Arrange for `event` to be invoked when the object is finalized.
    ///
    /// Returns false if the object is being or has been finalized.
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    unsafe fn register_finalization_callback(
        &self,
        object: ObjectId,
        event: DisposeEvent,
    ) -> bool;

    /// Undo a call to [`register_finalization_callback`].
    ///
    /// Does nothing if the event is not registered,
    /// for instance because it was already invoked.
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    ///
    /// [`register_finalization_callback`]: `Self::register_finalization_callback`
    unsafe fn deregister_finalization_callback(
        &self,
        object: ObjectId,
        event: DisposeEvent,
    );

    /// Prevent the object from being finalized.
    ///
    /// Returns false if the object is being or has been finalized.
    /// Temporary roots are counted; each successful call
    /// must be balanced by a call to [`remove_temporary_root`].
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    ///
    /// [`remove_temporary_root`]: `Self::remove_temporary_root`
    unsafe fn add_temporary_root(&self, object: ObjectId) -> bool;

    /// Undo a successful call to [`add_temporary_root`].
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    ///
    /// [`add_temporary_root`]: `Self::add_temporary_root`
    unsafe fn remove_temporary_root(&self, object: ObjectId);

    /// Prevent the object from being collected.
    ///
    /// Unlike a temporary root, this does not delay
    /// explicit finalization of the object.
    /// Returns false if the object is being or has been finalized.
    /// Roots are counted like temporary roots.
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    unsafe fn add_root(&self, object: ObjectId) -> bool;

    /// Undo a successful call to [`add_root`].
    ///
    /// This may be called after the object was finalized.
    ///
    /// # Safety
    ///
    /// The object must be managed by this collector.
    ///
    /// [`add_root`]: `Self::add_root`
    unsafe fn remove_root(&self, object: ObjectId);
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::heap::Instance};

    unsafe fn first(_: *const (), _: ObjectId)
    {
    }

    unsafe fn second(_: *const (), _: ObjectId)
    {
        unreachable!();
    }

    #[test]
    fn registrations_are_identified_by_context()
    {
        let (a, b) = (0u8, 0u8);
        let a = &a as *const u8 as *const ();
        let b = &b as *const u8 as *const ();

        assert_eq!(DisposeEvent::new(first, a), DisposeEvent::new(second, a));
        assert_ne!(DisposeEvent::new(first, a), DisposeEvent::new(first, b));

        let instance = Instance::new(());
        assert!(instance.header().register(DisposeEvent::new(second, a)));
        instance.header().deregister(DisposeEvent::new(first, a));
        assert_eq!(instance.header().dispose_event_count(), 0);
    }
}
