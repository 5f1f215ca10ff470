use {
    super::{
        Collector, DisposeEvent, Finalization, Header, Instance,
        ObjectId, PinnedRoot, Reference, State,
    },
    log::{debug, trace},
    scope_exit::scope_exit,
    std::{
        collections::HashMap,
        fmt,
        marker::{PhantomData, PhantomPinned},
        mem::take,
        ptr::{self, NonNull},
        sync::{Mutex, MutexGuard, PoisonError},
    },
};

/// Ensure that `'h` is an invariant lifetime.
pub (super) type HeapId<'h> = PhantomData<fn(&'h ()) -> &'h ()>;

/// Collector for managed objects.
///
/// Objects are allocated with [`alloc`] and stay live until they are
/// [released][`release`] and a subsequent [`collect`] finalizes them,
/// or until they are finalized explicitly with
/// [`finalize_instance`][`crate::lifetime::finalize_instance`].
/// The storage of every object is kept until the heap is destroyed,
/// so that references to finalized objects remain safe to inspect.
///
/// The `'h` parameter identifies the heap at the type level.
/// This prevents references to objects on one heap
/// from being handed to another heap.
///
/// [`alloc`]: `Self::alloc`
/// [`release`]: `Self::release`
/// [`collect`]: `Self::collect`
pub struct Heap<'h>
{
    /// Uniquely identifies this heap.
    _heap_id: HeapId<'h>,

    /// Heaps are referenced all over the place.
    _pinned: PhantomPinned,

    /// Every object ever allocated on this heap.
    objects: Mutex<HashMap<ObjectId, Object<'h>>>,

    /// Objects that are no longer used by the program.
    ///
    /// The next collection finalizes them,
    /// except for those that are pinned at the time.
    released: Mutex<Vec<ObjectId>>,
}

/// Type-erased managed object.
trait Managed: Send + Sync
{
    fn header(&self) -> &Header;
    fn finalize(&self, reset_memory: bool, reason: Finalization) -> bool;
}

impl<C> Managed for Instance<C>
    where C: Send + Sync
{
    fn header(&self) -> &Header
    {
        Instance::header(self)
    }

    fn finalize(&self, reset_memory: bool, reason: Finalization) -> bool
    {
        Instance::finalize(self, reset_memory, reason)
    }
}

/// Owning pointer to a managed object.
struct Object<'h>
{
    // INVARIANT: Obtained from Box::into_raw.
    inner: NonNull<dyn Managed + 'h>,
}

// SAFETY: Managed objects are Send + Sync.
unsafe impl<'h> Send for Object<'h> { }

impl<'h> Heap<'h>
{
    /// Create a heap with a unique `'h` parameter.
    ///
    /// The heap is passed to the given function.
    /// When the function returns or panics, the heap is destroyed,
    /// finalizing every object that is still live.
    pub fn with<F, R>(f: F) -> R
        // NOTE: Using Self here would allow the caller to choose 'h.
        //       That could result in multiple heaps with the same 'h.
        // NOTE: The heap must be behind a reference.
        //       Otherwise the given function could move it.
        where F: for<'i> FnOnce(&'i Heap<'i>) -> R
    {
        let heap = Heap{
            _heap_id: PhantomData,
            _pinned: PhantomPinned,
            objects: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
        };
        debug!("created heap at {:p}", &heap);
        scope_exit! { heap.destroy(); }
        f(&heap)
    }

    /// Finalize and free every object on the heap.
    ///
    /// Called once the function passed to [`with`][`Self::with`]
    /// has returned or panicked, so no references to objects remain.
    fn destroy(&self)
    {
        let objects = take(&mut *self.objects());
        debug!("destroying heap at {:p} with {} objects", self, objects.len());
        for (_, object) in objects {
            // SAFETY: Obtained from Box::into_raw,
            //         and no references to it outlive the heap.
            drop(unsafe { Box::from_raw(object.inner.as_ptr()) });
        }
    }

    /// Lock the object table.
    ///
    /// Teardown runs during unwinding, so poisoning is ignored.
    fn objects(&self) -> MutexGuard<HashMap<ObjectId, Object<'h>>>
    {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a live object.
    pub fn alloc<C>(&'h self, value: C) -> Gc<'h, C>
        where C: Send + Sync + 'h
    {
        let instance = Box::into_raw(Box::new(Instance::new(value)));

        // SAFETY: The instance is freed only when the heap is destroyed.
        let instance: &'h Instance<C> = unsafe { &*instance };

        let inner = NonNull::from(instance as &(dyn Managed + 'h));
        let mut objects = self.objects();
        objects.insert(instance.id(), Object{inner});

        trace!("allocated {:?}", instance.id());
        Gc::from_instance(instance)
    }

    /// Declare that the program no longer uses an object.
    ///
    /// The next [`collect`][`Self::collect`] finalizes the object,
    /// unless it is pinned at the time.
    /// Releasing an object more than once has no further effect.
    pub fn release<R>(&self, object: R)
        where R: Reference<Self>
    {
        let id = object.object();
        let mut released = self.released.lock().unwrap();
        if !released.contains(&id) {
            released.push(id);
        }
    }

    /// Finalize released objects that are not rooted.
    ///
    /// Objects with temporary roots or roots stay released
    /// and are retried by the next collection.
    /// Returns the number of objects finalized.
    pub fn collect(&self) -> usize
    {
        let candidates = take(&mut *self.released.lock().unwrap());

        let mut finalized = 0;
        let mut deferred = Vec::new();
        for id in candidates {
            let object = self.object(id);
            if object.finalize(true, Finalization::Collection) {
                finalized += 1;
            } else if object.header().state() == State::Live {
                deferred.push(id);
            }
        }

        debug!(
            "collected {finalized} objects, deferred {} rooted objects",
            deferred.len(),
        );

        self.released.lock().unwrap().extend(deferred);
        finalized
    }

    /// The number of objects that are live.
    pub fn live_count(&self) -> usize
    {
        let objects = self.objects();
        objects.values()
            // SAFETY: Objects are freed only when the heap is destroyed.
            .filter(|o| unsafe { o.inner.as_ref() }.header().state() == State::Live)
            .count()
    }

    /// Find an object allocated on this heap.
    fn object(&self, id: ObjectId) -> &(dyn Managed + 'h)
    {
        let objects = self.objects();
        let object = objects.get(&id).expect("Object is not on this heap");
        // SAFETY: Objects are freed only when the heap is destroyed.
        unsafe { &*object.inner.as_ptr() }
    }
}

// SAFETY: Objects on this heap are instances, which uphold the contract.
unsafe impl<'h> Collector for Heap<'h>
{
    unsafe fn register_finalization_callback(
        &self,
        object: ObjectId,
        event: DisposeEvent,
    ) -> bool
    {
        object.header().register(event)
    }

    unsafe fn deregister_finalization_callback(
        &self,
        object: ObjectId,
        event: DisposeEvent,
    )
    {
        object.header().deregister(event);
    }

    unsafe fn add_temporary_root(&self, object: ObjectId) -> bool
    {
        object.header().add_temporary_root()
    }

    unsafe fn remove_temporary_root(&self, object: ObjectId)
    {
        object.header().remove_temporary_root();
    }

    unsafe fn add_root(&self, object: ObjectId) -> bool
    {
        object.header().add_root()
    }

    unsafe fn remove_root(&self, object: ObjectId)
    {
        object.header().remove_root();
    }
}

/// Reference to an object on a heap.
///
/// Gc references are plain pointers; they do not keep the object live.
/// To access the value, [pin][`Self::pin`] the object.
pub struct Gc<'h, C>
{
    instance: &'h Instance<C>,
}

impl<'h, C> Gc<'h, C>
{
    pub (super) fn from_instance(instance: &'h Instance<C>) -> Self
    {
        Self{instance}
    }

    /// The instance this reference refers to.
    pub fn instance(self) -> &'h Instance<C>
    {
        self.instance
    }

    /// The identity of the object.
    pub fn id(self) -> ObjectId
    {
        self.instance.id()
    }

    /// Pin the object to access its value.
    ///
    /// Returns [`None`] if the object is being or has been finalized.
    pub fn pin(self) -> Option<PinnedRoot<'h, C>>
    {
        PinnedRoot::new(self)
    }

    /// Whether the object was finalized.
    pub fn is_finalized(self) -> bool
    {
        crate::lifetime::is_finalized(self.instance)
    }
}

impl<'h, C> Clone for Gc<'h, C>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<'h, C> Copy for Gc<'h, C>
{
}

impl<'h, C> PartialEq for Gc<'h, C>
{
    fn eq(&self, other: &Self) -> bool
    {
        ptr::eq(self.instance, other.instance)
    }
}

impl<'h, C> Eq for Gc<'h, C>
{
}

impl<'h, C> fmt::Debug for Gc<'h, C>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Gc({:?})", self.id())
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{heap::Delegate, lifetime::finalize_instance},
        std::{
            panic::{AssertUnwindSafe, catch_unwind},
            sync::{Arc, atomic::{AtomicUsize, Ordering::SeqCst}},
        },
    };

    /// Value that counts how often it is dropped.
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked
    {
        fn drop(&mut self)
        {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn collect_finalizes_released_objects()
    {
        let drops = Arc::new(AtomicUsize::new(0));
        Heap::with(|heap| {
            let a = heap.alloc(Tracked(drops.clone()));
            let b = heap.alloc(Tracked(drops.clone()));
            assert_eq!(heap.live_count(), 2);

            heap.release(a);
            heap.release(a);
            assert_eq!(heap.collect(), 1);
            assert_eq!(drops.load(SeqCst), 1);
            assert!(a.is_finalized());
            assert!(a.pin().is_none());
            assert!(b.pin().is_some());
            assert_eq!(heap.live_count(), 1);
        });
        assert_eq!(drops.load(SeqCst), 2);
    }

    #[test]
    fn pinned_objects_survive_collection()
    {
        Heap::with(|heap| {
            let object = heap.alloc(String::from("pinned"));
            let pinned = object.pin().unwrap();
            heap.release(object);

            assert_eq!(heap.collect(), 0);
            assert_eq!(&*pinned, "pinned");
            assert_eq!(&*pinned.clone(), "pinned");

            drop(pinned);
            assert_eq!(heap.collect(), 1);
            assert_eq!(heap.collect(), 0);
        });
    }

    #[test]
    fn explicit_finalization_preempts_collection()
    {
        Heap::with(|heap| {
            let object = heap.alloc(7u64);
            finalize_instance(object.instance(), true);
            heap.release(object);
            assert_eq!(heap.collect(), 0);
            assert_eq!(heap.live_count(), 0);
        });
    }

    #[test]
    fn delegates_call_until_finalized()
    {
        Heap::with(|heap| {
            let object = heap.alloc(vec![1, 2, 3]);
            let delegate = Delegate::new(object, Vec::len);
            assert_eq!(delegate.call(), Some(3));
            assert_eq!(delegate.target(), object);
            assert_eq!(Reference::object(&delegate), object.id());
            heap.release(delegate);
            heap.collect();
            assert_eq!(delegate.call(), None);
        });
    }

    #[test]
    fn collector_temporary_roots_block_finalization()
    {
        Heap::with(|heap| {
            let object = heap.alloc(());
            unsafe {
                assert!(heap.add_temporary_root(object.id()));
                assert!(heap.add_temporary_root(object.id()));
                heap.release(object);
                assert_eq!(heap.collect(), 0);
                heap.remove_temporary_root(object.id());
                assert_eq!(heap.collect(), 0);
                heap.remove_temporary_root(object.id());
                assert_eq!(heap.collect(), 1);
                assert!(!heap.add_temporary_root(object.id()));
            }
        });
    }

    #[test]
    fn pinning_finalized_objects_fails()
    {
        Heap::with(|heap| {
            let object = heap.alloc(String::from("gone"));
            finalize_instance(object.instance(), true);
            assert!(object.pin().is_none());
            assert!(object.pin().is_none());
            assert!(!object.instance().header().is_pinned());
            assert_eq!(Delegate::new(object, String::len).call(), None);
        });
    }

    #[test]
    fn roots_hold_off_collection_only()
    {
        let drops = Arc::new(AtomicUsize::new(0));
        Heap::with(|heap| {
            let object = heap.alloc(Tracked(drops.clone()));
            unsafe {
                assert!(heap.add_root(object.id()));
                heap.release(object);
                assert_eq!(heap.collect(), 0);
                assert_eq!(drops.load(SeqCst), 0);

                finalize_instance(object.instance(), false);
                assert_eq!(drops.load(SeqCst), 1);
                assert!(!heap.add_root(object.id()));
                heap.remove_root(object.id());
            }
            assert_eq!(heap.collect(), 0);
        });
        assert_eq!(drops.load(SeqCst), 1);
    }

    #[test]
    fn destruction_finalizes_live_objects_even_on_panic()
    {
        let drops = Arc::new(AtomicUsize::new(0));
        let result = catch_unwind(AssertUnwindSafe(|| {
            Heap::with(|heap| {
                let object = heap.alloc(Tracked(drops.clone()));
                unsafe { assert!(heap.add_root(object.id())); }
                heap.alloc(Tracked(drops.clone()));
                panic!("leaving the heap");
            })
        }));
        assert!(result.is_err());
        assert_eq!(drops.load(SeqCst), 2);
    }
}
