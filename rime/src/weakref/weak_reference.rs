use {
    super::TargetFinalized,
    crate::heap::{Collector, DisposeEvent, ObjectId, Reference},
    allocator_ext::{ArrayLayout, ProcessHeap, RawBlock, UnalignedAllocator, raw_allocate},
    log::trace,
    scope_exit::scope_exit,
    std::{
        fmt,
        marker::PhantomData,
        ptr::{self, NonNull},
        sync::atomic::{AtomicPtr, Ordering::*},
    },
};

/// Weak reference to a managed object.
///
/// The target is stored in a block allocated from `A`.
/// The block is freed by whoever clears the reference first:
/// the dispose event when the target is finalized,
/// or the destructor of the weak reference.
pub struct WeakReference<'a, T, C, A = ProcessHeap>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    collector: &'a C,

    // INVARIANT: Boxed so that the dispose event can refer to it.
    slot: Box<Slot<'a, T, A>>,
}

/// State shared with the dispose event.
struct Slot<'a, T, A>
    where A: ?Sized
{
    // INVARIANT: Null, or a block from allocator holding the target.
    target: AtomicPtr<T>,

    object: ObjectId,

    allocator: &'a A,

    _target: PhantomData<T>,
}

impl<'a, T, C, A> WeakReference<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    /// Create a weak reference to a live object.
    ///
    /// Returns an error if the object is being or has been finalized.
    pub fn new(collector: &'a C, allocator: &'a A, target: T)
        -> Result<Self, TargetFinalized>
    {
        let block = raw_allocate(allocator, ArrayLayout::of::<T>(), 1, false);
        let block = block.into_raw().cast::<T>();
        // SAFETY: The block has room for one T.
        unsafe { block.as_ptr().write(target); }

        let object = target.object();
        let slot = Box::new(Slot{
            target: AtomicPtr::new(block.as_ptr()),
            object,
            allocator,
            _target: PhantomData,
        });

        // SAFETY: T: Reference<C>, so the object is managed by collector.
        let registered = unsafe {
            collector.register_finalization_callback(object, slot.event())
        };

        if !registered {
            // SAFETY: The event was never registered, so we own the block.
            unsafe { free_block(allocator, block); }
            return Err(TargetFinalized(()));
        }

        trace!("weak reference to {object:?} at {block:p}");
        Ok(Self{collector, slot})
    }

    /// Whether the target was not yet finalized.
    pub fn alive(&self) -> bool
    {
        !self.slot.target.load(Acquire).is_null()
    }

    /// The target, if it was not yet finalized.
    pub fn target(&self) -> Option<T>
    {
        if !self.alive() {
            return None;
        }

        let object = self.slot.object;

        // SAFETY: T: Reference<C>, so the object is managed by collector.
        if !unsafe { self.collector.add_temporary_root(object) } {
            return None;
        }
        scope_exit! {
            // SAFETY: Balances the temporary root added above.
            unsafe { self.collector.remove_temporary_root(object); }
        }

        // The target may have been finalized before it was pinned.
        let block = self.slot.target.load(Acquire);
        if block.is_null() {
            return None;
        }

        // SAFETY: The target is pinned, so the dispose event
        //         cannot free the block while we read it.
        Some(unsafe { block.read() })
    }

    /// The identity of the target.
    pub fn object(&self) -> ObjectId
    {
        self.slot.object
    }
}

impl<'a, T, A> Slot<'a, T, A>
    where A: UnalignedAllocator + ?Sized
{
    fn event(&self) -> DisposeEvent
    {
        DisposeEvent::new(
            on_target_disposed::<T, A>,
            self as *const Self as *const (),
        )
    }
}

/// Clear a weak reference whose target is being finalized.
///
/// # Safety
///
/// `context` must point to a live slot.
unsafe fn on_target_disposed<T, A>(context: *const (), object: ObjectId)
    where A: UnalignedAllocator + ?Sized
{
    let slot = &*context.cast::<Slot<T, A>>();
    let allocator = slot.allocator;
    let block = slot.target.swap(ptr::null_mut(), AcqRel);
    if let Some(block) = NonNull::new(block) {
        trace!("target {object:?} disposed, freeing {block:p}");
        free_block(allocator, block);
    }
}

/// Free the block of a weak reference.
///
/// # Safety
///
/// The block must have been allocated by [`WeakReference::new`]
/// with the given allocator, and must not have been freed.
unsafe fn free_block<T, A>(allocator: &A, block: NonNull<T>)
    where A: UnalignedAllocator + ?Sized
{
    let layout = ArrayLayout::of::<T>();
    drop(RawBlock::from_raw(allocator, block.cast(), layout, 1));
}

impl<'a, T, C, A> Drop for WeakReference<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    fn drop(&mut self)
    {
        let block = self.slot.target.swap(ptr::null_mut(), AcqRel);

        // Also waits for a dispose event in flight,
        // which may still be using the slot.
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe {
            self.collector.deregister_finalization_callback(
                self.slot.object,
                self.slot.event(),
            );
        }

        if let Some(block) = NonNull::new(block) {
            // SAFETY: We cleared the slot, so the block is ours.
            unsafe { free_block(self.slot.allocator, block); }
        }
    }
}

impl<'a, T, C, A> fmt::Debug for WeakReference<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("WeakReference")
            .field("object", &self.slot.object)
            .field("alive", &self.alive())
            .finish()
    }
}

/// Create a weak reference whose block lives on the process heap.
pub fn weak_reference<'a, T, C>(collector: &'a C, target: T)
    -> Result<WeakReference<'a, T, C>, TargetFinalized>
    where T: Reference<C>, C: Collector + ?Sized
{
    WeakReference::new(collector, &ProcessHeap, target)
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{heap::{Delegate, Heap}, lifetime::finalize_instance},
        std::{
            sync::atomic::{AtomicBool, AtomicUsize},
            thread,
        },
    };

    /// Process heap that counts outstanding blocks.
    #[derive(Default)]
    struct Outstanding
    {
        blocks: AtomicUsize,
    }

    unsafe impl UnalignedAllocator for Outstanding
    {
        fn try_allocate(&self, byte_count: usize) -> Option<NonNull<u8>>
        {
            self.blocks.fetch_add(1, SeqCst);
            ProcessHeap.try_allocate(byte_count)
        }

        unsafe fn try_reallocate(
            &self,
            ptr: NonNull<u8>,
            preserve_byte_count: usize,
            byte_count: usize,
        ) -> Option<NonNull<u8>>
        {
            ProcessHeap.try_reallocate(ptr, preserve_byte_count, byte_count)
        }

        unsafe fn free(&self, ptr: Option<NonNull<u8>>)
        {
            if ptr.is_some() {
                self.blocks.fetch_sub(1, SeqCst);
            }
            ProcessHeap.free(ptr)
        }
    }

    #[test]
    fn target_is_cleared_by_finalization()
    {
        Heap::with(|heap| {
            let object = heap.alloc(String::from("target"));
            let weak = weak_reference(heap, object).unwrap();
            assert!(weak.alive());
            assert_eq!(weak.target(), Some(object));
            assert_eq!(weak.target(), Some(object));

            finalize_instance(object.instance(), true);
            assert!(!weak.alive());
            assert_eq!(weak.target(), None);
        });
    }

    #[test]
    fn collection_clears_unread_references()
    {
        Heap::with(|heap| {
            let object = heap.alloc(1u8);
            let weak = weak_reference(heap, object).unwrap();
            heap.release(object);
            assert_eq!(heap.collect(), 1);
            assert!(!weak.alive());
            assert_eq!(weak.target(), None);
        });
    }

    #[test]
    fn finalized_targets_are_rejected()
    {
        Heap::with(|heap| {
            let allocator = Outstanding::default();
            let object = heap.alloc(());
            finalize_instance(object.instance(), false);
            let result = WeakReference::new(heap, &allocator, object);
            assert_eq!(result.err(), Some(TargetFinalized(())));
            assert_eq!(allocator.blocks.load(SeqCst), 0);
        });
    }

    #[test]
    fn blocks_are_freed_exactly_once()
    {
        let allocator = Outstanding::default();
        Heap::with(|heap| {
            let a = heap.alloc(0u32);
            let b = heap.alloc(0u32);

            let weak_a = WeakReference::new(heap, &allocator, a).unwrap();
            let weak_b = WeakReference::new(heap, &allocator, b).unwrap();
            assert_eq!(allocator.blocks.load(SeqCst), 2);

            // Dropped before its target dies.
            drop(weak_a);
            assert_eq!(allocator.blocks.load(SeqCst), 1);
            assert_eq!(a.instance().header().dispose_event_count(), 0);

            // Dropped after its target died.
            finalize_instance(b.instance(), true);
            assert_eq!(allocator.blocks.load(SeqCst), 0);
            drop(weak_b);
            assert_eq!(allocator.blocks.load(SeqCst), 0);
        });
    }

    #[test]
    fn delegates_can_be_weakly_referenced()
    {
        Heap::with(|heap| {
            let object = heap.alloc(vec![1u8, 2]);
            let delegate = Delegate::new(object, |v: &Vec<u8>| v.len());
            let weak = weak_reference(heap, delegate).unwrap();
            let strong = weak.target().unwrap();
            assert_eq!(strong.call(), Some(2));
            finalize_instance(object.instance(), true);
            assert!(weak.target().is_none());
        });
    }

    #[test]
    fn concurrent_reads_race_finalization_safely()
    {
        Heap::with(|heap| {
            let object = heap.alloc(String::from("contended"));
            let weak = weak_reference(heap, object).unwrap();
            let done = AtomicBool::new(false);

            thread::scope(|scope| {
                for _ in 0 .. 4 {
                    scope.spawn(|| {
                        let mut observed_dead = false;
                        while !done.load(SeqCst) {
                            match weak.target() {
                                Some(target) => {
                                    assert!(!observed_dead);
                                    assert_eq!(target, object);
                                },
                                None => observed_dead = true,
                            }
                        }
                    });
                }
                thread::yield_now();
                finalize_instance(object.instance(), true);
                done.store(true, SeqCst);
            });

            assert_eq!(weak.target(), None);
        });
    }
}
