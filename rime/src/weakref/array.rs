use {
    crate::{
        allocation::{Buffer, allocate, reallocate},
        heap::{Collector, DisposeEvent, ObjectId, Reference},
    },
    allocator_ext::{ProcessHeap, UnalignedAllocator},
    log::trace,
    scope_exit::scope_exit,
    smallvec::SmallVec,
    std::{
        fmt,
        sync::{Mutex, atomic::{AtomicUsize, Ordering::*}},
    },
};

/// Distinct object identities.
type Objects = SmallVec<[ObjectId; 8]>;

/// Growable array of weak references.
///
/// Every distinct live target has exactly one dispose event registered,
/// shared by all slots that refer to it.
/// When a target is finalized, all slots referring to it are cleared.
///
/// The array can be made hard with [`make_hard`][`Self::make_hard`],
/// which roots every target so that collections keep them
/// and reads need not pin them,
/// until [`make_weak`][`Self::make_weak`] is called.
/// Explicit finalization of a target still clears its slots.
pub struct WeakReferenceArray<'a, T, C, A = ProcessHeap>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    collector: &'a C,

    // INVARIANT: Boxed so that dispose events can refer to it.
    shared: Box<Shared<'a, T, A>>,

    // INVARIANT: If the array is hard, the distinct targets
    //            that were rooted by it, each rooted once.
    hard_roots: Option<Objects>,
}

/// State shared with the dispose events.
struct Shared<'a, T, A>
    where A: UnalignedAllocator + ?Sized
{
    // Never held while calling the collector.
    entries: Mutex<Entries<'a, T, A>>,

    // INVARIANT: The number of live slots.
    alive: AtomicUsize,
}

struct Entries<'a, T, A>
    where A: UnalignedAllocator + ?Sized
{
    // INVARIANT: Fully initialized. Its length is the capacity.
    slots: Buffer<'a, Option<T>, A>,

    // INVARIANT: Slots at len and beyond are None.
    len: usize,
}

impl<'a, T, A> Entries<'a, T, A>
    where T: Copy, A: UnalignedAllocator + ?Sized
{
    fn slots(&self) -> &[Option<T>]
    {
        let slots = self.slots.as_slice().unwrap_or(&[]);
        &slots[.. self.len]
    }

    fn slots_mut(&mut self) -> &mut [Option<T>]
    {
        let slots = self.slots.as_mut_slice().unwrap_or(&mut []);
        &mut slots[.. self.len]
    }

    fn capacity(&self) -> usize
    {
        self.slots.len()
    }

    fn reserve_one(&mut self)
    {
        if self.len < self.capacity() {
            return;
        }
        let new_capacity = self.capacity().checked_mul(2)
            .expect("Weak reference array is too large")
            .max(4);
        reallocate(&mut self.slots, new_capacity, true);
    }
}

impl<'a, T, C, A> WeakReferenceArray<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    /// Create an empty array.
    ///
    /// This does not allocate.
    pub fn new(collector: &'a C, allocator: &'a A) -> Self
    {
        Self::with_capacity(collector, allocator, 0)
    }

    /// Create an empty array with room for `capacity` slots.
    pub fn with_capacity(collector: &'a C, allocator: &'a A, capacity: usize)
        -> Self
    {
        let entries = Entries{slots: allocate(allocator, capacity, true), len: 0};
        let shared = Shared{entries: Mutex::new(entries), alive: AtomicUsize::new(0)};
        Self{
            collector,
            shared: Box::new(shared),
            hard_roots: None,
        }
    }

    /// The number of slots, live or not.
    pub fn len(&self) -> usize
    {
        self.shared.entries.lock().unwrap().len
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// The number of slots that fit without reallocating.
    pub fn capacity(&self) -> usize
    {
        self.shared.entries.lock().unwrap().capacity()
    }

    /// The number of slots whose target was not yet finalized.
    pub fn alive_count(&self) -> usize
    {
        self.shared.alive.load(Acquire)
    }

    /// Whether the array is hard.
    pub fn is_hard(&self) -> bool
    {
        self.hard_roots.is_some()
    }

    fn event(&self) -> DisposeEvent
    {
        DisposeEvent::new(
            on_target_disposed::<T, C, A>,
            &*self.shared as *const Shared<T, A> as *const (),
        )
    }

    /// Root an object, returning whether it is live.
    fn root(&self, object: ObjectId) -> bool
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe { self.collector.add_root(object) }
    }

    fn unroot(&self, object: ObjectId)
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe { self.collector.remove_root(object); }
    }

    /// Pin an object, returning whether it is live.
    fn pin(&self, object: ObjectId) -> bool
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe { self.collector.add_temporary_root(object) }
    }

    fn unpin(&self, object: ObjectId)
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe { self.collector.remove_temporary_root(object); }
    }

    /// Start tracking a target that no slot referred to before.
    ///
    /// The target must be pinned by the caller.
    fn attach(&mut self, object: ObjectId)
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        let registered = unsafe {
            self.collector.register_finalization_callback(object, self.event())
        };
        debug_assert!(registered, "Pinned object is not live");

        if let Some(hard_roots) = &mut self.hard_roots {
            // SAFETY: T: Reference<C>, so the object is managed by collector.
            if unsafe { self.collector.add_root(object) } {
                hard_roots.push(object);
            }
        }
    }

    /// Stop tracking a target that no slot refers to anymore.
    fn detach(&mut self, object: ObjectId)
    {
        // SAFETY: T: Reference<C>, so the object is managed by collector.
        unsafe {
            self.collector.deregister_finalization_callback(object, self.event());
        }

        if let Some(hard_roots) = &mut self.hard_roots {
            if let Some(index) = hard_roots.iter().position(|&o| o == object) {
                hard_roots.swap_remove(index);
                // SAFETY: Balances the root added by attach or make_hard.
                unsafe { self.collector.remove_root(object); }
            }
        }
    }

    /// Append a weak reference to `target`.
    ///
    /// If the target is already being finalized,
    /// the new slot is dead from the start.
    pub fn push(&mut self, target: T)
    {
        let object = target.object();
        let live = self.pin(object);
        let collector = self.collector;
        scope_exit! {
            // SAFETY: Balances the temporary root added above.
            if live { unsafe { collector.remove_temporary_root(object); } }
        }

        let is_new = {
            let mut entries = self.shared.entries.lock().unwrap();
            let is_new = live && !references::<T, C>(entries.slots(), object);
            entries.reserve_one();
            let index = entries.len;
            entries.len += 1;
            if live {
                entries.slots_mut()[index] = Some(target);
                self.shared.alive.fetch_add(1, Release);
            }
            is_new
        };

        if is_new {
            self.attach(object);
        }
    }

    /// The target of a slot, if it was not yet finalized.
    ///
    /// # Panics
    ///
    /// If `index` is out of bounds.
    pub fn get(&self, index: usize) -> Option<T>
    {
        let target = self.slot(index)?;

        // Slots of finalized targets are cleared under the lock.
        if self.is_hard() {
            return Some(target);
        }

        let object = target.object();
        if !self.pin(object) {
            return None;
        }
        scope_exit! { self.unpin(object); }

        // The target may have been finalized before it was pinned.
        self.slot(index)
    }

    /// Read a slot, panicking after the lock is released.
    fn slot(&self, index: usize) -> Option<T>
    {
        let slot = self.shared.entries.lock().unwrap().slots().get(index).copied();
        slot.unwrap_or_else(|| panic!("Weak reference index {index} out of bounds"))
    }

    /// Retarget a slot.
    ///
    /// The dispose event of the old target is deregistered
    /// only if no other slot refers to it.
    ///
    /// # Panics
    ///
    /// If `index` is out of bounds.
    pub fn set(&mut self, index: usize, target: Option<T>)
    {
        let len = self.len();
        assert!(index < len, "Weak reference index {index} out of bounds");

        let new_object = target.map(|t| t.object());
        let live = new_object.map_or(false, |o| self.pin(o));
        let collector = self.collector;
        scope_exit! {
            if let (true, Some(object)) = (live, new_object) {
                // SAFETY: Balances the temporary root added above.
                unsafe { collector.remove_temporary_root(object); }
            }
        }

        let (attach, detach) = {
            let mut entries = self.shared.entries.lock().unwrap();
            let slots = entries.slots_mut();
            let old = slots[index].take();
            let old_object = old.map(|t| t.object());

            if live {
                slots[index] = target;
            }

            match (old.is_some(), live) {
                (false, true) => { self.shared.alive.fetch_add(1, Release); },
                (true, false) => { self.shared.alive.fetch_sub(1, Release); },
                _ => { },
            }

            // Linear scans, in favor of a per-target reference count.
            let slots = entries.slots();
            let attach = new_object.filter(|&o| {
                live && Some(o) != old_object
                    && !references_except::<T, C>(slots, o, index)
            });
            let detach = old_object.filter(|&o| {
                Some(o) != new_object.filter(|_| live)
                    && !references::<T, C>(slots, o)
            });
            (attach, detach)
        };

        if let Some(object) = attach {
            self.attach(object);
        }
        if let Some(object) = detach {
            self.detach(object);
        }
    }

    /// Remove all dead slots.
    ///
    /// The live slots keep their relative order.
    pub fn remove_dead(&mut self)
    {
        let mut entries = self.shared.entries.lock().unwrap();
        let slots = entries.slots_mut();
        let mut kept = 0;
        for index in 0 .. slots.len() {
            if slots[index].is_some() {
                slots.swap(kept, index);
                kept += 1;
            }
        }
        let removed = slots.len() - kept;
        entries.len = kept;
        trace!("removed {removed} dead weak references");
    }

    /// Snapshot of the targets that were not yet finalized.
    pub fn targets(&self) -> Vec<T>
    {
        let entries = self.shared.entries.lock().unwrap();
        entries.slots().iter().flatten().copied().collect()
    }

    /// Remove all slots.
    pub fn clear(&mut self)
    {
        let objects = {
            let mut entries = self.shared.entries.lock().unwrap();
            let objects = distinct_objects::<T, C>(entries.slots());
            entries.slots_mut().fill(None);
            entries.len = 0;
            self.shared.alive.store(0, Release);
            objects
        };

        for object in objects {
            self.detach(object);
        }
    }

    /// Root every target, so that reads need not pin them.
    ///
    /// Targets rooted this way are not collected
    /// until [`make_weak`][`Self::make_weak`] is called.
    /// They can still be finalized explicitly,
    /// which clears their slots as usual.
    pub fn make_hard(&mut self)
    {
        if self.is_hard() {
            return;
        }

        let objects = {
            let entries = self.shared.entries.lock().unwrap();
            distinct_objects::<T, C>(entries.slots())
        };

        let rooted = objects.into_iter().filter(|&o| self.root(o)).collect();
        self.hard_roots = Some(rooted);
    }

    /// Undo [`make_hard`][`Self::make_hard`].
    pub fn make_weak(&mut self)
    {
        for object in self.hard_roots.take().into_iter().flatten() {
            self.unroot(object);
        }
    }
}

/// Whether any slot refers to the object.
fn references<T, C>(slots: &[Option<T>], object: ObjectId) -> bool
    where T: Reference<C>, C: ?Sized
{
    slots.iter().flatten().any(|t| t.object() == object)
}

/// Whether any slot other than `except` refers to the object.
fn references_except<T, C>(slots: &[Option<T>], object: ObjectId, except: usize)
    -> bool
    where T: Reference<C>, C: ?Sized
{
    slots.iter().enumerate()
        .filter(|&(index, _)| index != except)
        .any(|(_, t)| t.map_or(false, |t| t.object() == object))
}

/// The distinct objects referred to by the slots, in order.
fn distinct_objects<T, C>(slots: &[Option<T>]) -> Objects
    where T: Reference<C>, C: ?Sized
{
    let mut objects = Objects::new();
    for object in slots.iter().flatten().map(|t| t.object()) {
        if !objects.contains(&object) {
            objects.push(object);
        }
    }
    objects
}

/// Clear every slot whose target is being finalized.
///
/// # Safety
///
/// `context` must point to the live shared state of an array.
unsafe fn on_target_disposed<T, C, A>(context: *const (), object: ObjectId)
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + ?Sized,
{
    let shared = &*context.cast::<Shared<T, A>>();
    let mut entries = shared.entries.lock().unwrap();

    let mut cleared = 0;
    for slot in entries.slots_mut() {
        if slot.map_or(false, |t| t.object() == object) {
            *slot = None;
            cleared += 1;
        }
    }

    shared.alive.fetch_sub(cleared, Release);
    trace!("target {object:?} disposed, cleared {cleared} weak references");
}

impl<'a, T, C, A> Drop for WeakReferenceArray<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    fn drop(&mut self)
    {
        // Deregistering also waits for dispose events in flight,
        // which may still be using the shared state.
        self.clear();
        self.make_weak();
    }
}

impl<'a, T, C, A> fmt::Debug for WeakReferenceArray<'a, T, C, A>
    where
        T: Reference<C>,
        C: Collector + ?Sized,
        A: UnalignedAllocator + Sync + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("WeakReferenceArray")
            .field("len", &self.len())
            .field("alive", &self.alive_count())
            .field("hard", &self.is_hard())
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{heap::{Gc, Heap}, lifetime::finalize_instance},
        proptest::{self as p, proptest},
    };

    fn events<C>(object: Gc<C>) -> usize
    {
        object.instance().header().dispose_event_count()
    }

    #[test]
    fn one_event_per_distinct_target()
    {
        Heap::with(|heap| {
            let a = heap.alloc(1u32);
            let b = heap.alloc(2u32);
            let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
            assert!(array.is_empty());
            assert_eq!(array.capacity(), 0);

            array.push(a);
            array.push(b);
            array.push(a);
            assert_eq!(array.len(), 3);
            assert_eq!(array.alive_count(), 3);
            assert!(array.capacity() >= 3);
            assert_eq!((events(a), events(b)), (1, 1));
            assert_eq!(array.get(2), Some(a));
            assert_eq!(array.targets(), [a, b, a]);
        });
    }

    #[test]
    fn finalization_clears_every_slot_of_the_target()
    {
        Heap::with(|heap| {
            let a = heap.alloc(String::from("a"));
            let b = heap.alloc(String::from("b"));
            let mut array = WeakReferenceArray::with_capacity(heap, &ProcessHeap, 2);
            array.push(a);
            array.push(b);
            array.push(a);

            finalize_instance(a.instance(), true);
            assert_eq!(array.get(0), None);
            assert_eq!(array.get(1), Some(b));
            assert_eq!(array.get(2), None);
            assert_eq!(array.alive_count(), 1);

            array.remove_dead();
            assert_eq!(array.len(), 1);
            assert_eq!(array.targets(), [b]);
        });
    }

    #[test]
    fn set_deregisters_unreferenced_targets()
    {
        Heap::with(|heap| {
            let a = heap.alloc(());
            let b = heap.alloc(());
            let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
            array.push(a);
            array.push(b);
            array.push(a);

            array.set(0, Some(b));
            assert_eq!((events(a), events(b)), (1, 1));

            array.set(2, None);
            assert_eq!((events(a), events(b)), (0, 1));
            assert_eq!(array.alive_count(), 2);
            assert_eq!(array.targets(), [b, b]);

            array.set(1, Some(a));
            assert_eq!((events(a), events(b)), (1, 1));
        });
    }

    #[test]
    fn finalized_targets_make_dead_slots()
    {
        Heap::with(|heap| {
            let a = heap.alloc(0u8);
            finalize_instance(a.instance(), false);
            let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
            array.push(a);
            assert_eq!(array.len(), 1);
            assert_eq!(array.alive_count(), 0);
            assert_eq!(array.get(0), None);
            array.set(0, Some(a));
            assert_eq!(array.alive_count(), 0);
        });
    }

    #[test]
    #[should_panic]
    fn get_out_of_bounds()
    {
        Heap::with(|heap| {
            let array = WeakReferenceArray::<Gc<()>, _>::new(heap, &ProcessHeap);
            array.get(0);
        });
    }

    #[test]
    fn hard_arrays_keep_targets_alive()
    {
        Heap::with(|heap| {
            let a = heap.alloc(1i64);
            let b = heap.alloc(2i64);
            let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
            array.push(a);
            array.make_hard();
            assert!(array.is_hard());
            array.push(b);

            heap.release(a);
            heap.release(b);
            assert_eq!(heap.collect(), 0);
            assert_eq!(array.targets(), [a, b]);

            array.make_weak();
            assert!(!array.is_hard());
            assert_eq!(heap.collect(), 2);
            assert_eq!(array.get(0), None);
            assert_eq!(array.alive_count(), 0);
        });
    }

    #[test]
    fn drop_deregisters_and_unroots()
    {
        Heap::with(|heap| {
            let a = heap.alloc(1u16);
            {
                let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
                array.push(a);
                array.push(a);
                array.make_hard();
                assert!(a.instance().header().is_rooted());
                assert!(!a.instance().header().is_pinned());
            }
            assert_eq!(events(a), 0);
            assert!(!a.instance().header().is_rooted());
            heap.release(a);
            assert_eq!(heap.collect(), 1);
        });
    }

    #[test]
    fn hard_targets_can_be_finalized_explicitly()
    {
        Heap::with(|heap| {
            let a = heap.alloc(String::from("a"));
            let b = heap.alloc(String::from("b"));
            let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
            array.push(a);
            array.push(b);
            array.make_hard();

            finalize_instance(a.instance(), true);
            assert!(a.is_finalized());
            assert_eq!(array.get(0), None);
            assert_eq!(array.get(1), Some(b));
            assert_eq!(array.alive_count(), 1);

            array.make_weak();
            assert!(!a.instance().header().is_rooted());
            assert!(!b.instance().header().is_rooted());
        });
    }

    proptest!
    {
        #[test]
        fn slots_follow_model(
            ops in p::collection::vec((0u8 .. 5, 0usize .. 8, 0usize .. 4), 0 .. 48),
        )
        {
            Heap::with(|heap| {
                let objects: Vec<_> = (0 .. 4u32).map(|v| heap.alloc(v)).collect();
                let mut array = WeakReferenceArray::new(heap, &ProcessHeap);
                let mut model: Vec<Option<usize>> = Vec::new();
                let mut finalized = [false; 4];

                for (kind, index, k) in ops {
                    match kind {
                        0 => {
                            array.push(objects[k]);
                            model.push((!finalized[k]).then_some(k));
                        },
                        1 | 2 if !model.is_empty() => {
                            let index = index % model.len();
                            let target = (kind == 1).then_some(k);
                            array.set(index, target.map(|k| objects[k]));
                            model[index] = target.filter(|&k| !finalized[k]);
                        },
                        3 => {
                            finalize_instance(objects[k].instance(), false);
                            finalized[k] = true;
                            for slot in &mut model {
                                if *slot == Some(k) {
                                    *slot = None;
                                }
                            }
                        },
                        4 => {
                            array.remove_dead();
                            model.retain(Option::is_some);
                        },
                        _ => { },
                    }

                    assert_eq!(array.len(), model.len());
                    assert_eq!(array.alive_count(), model.iter().flatten().count());
                    let expected: Vec<_> =
                        model.iter().flatten().map(|&k| objects[k]).collect();
                    assert_eq!(array.targets(), expected);
                    for (index, slot) in model.iter().enumerate() {
                        assert_eq!(array.get(index), slot.map(|k| objects[k]));
                    }
                    for (k, &object) in objects.iter().enumerate() {
                        let referenced = model.contains(&Some(k));
                        assert_eq!(events(object), referenced as usize);
                    }
                }
            });
        }
    }
}
