use {
    super::{DisposeEvent, ObjectId},
    log::debug,
    non_zero_ext::NonZeroExt,
    scope_exit::scope_exit,
    std::{
        cell::UnsafeCell,
        mem::{MaybeUninit, take},
        num::NonZeroU64,
        ptr,
        sync::{Condvar, Mutex, MutexGuard, PoisonError, atomic::{AtomicU8, Ordering::*}},
    },
};

/// Lifecycle state of a managed object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum State
{
    /// The object was finalized, or never constructed.
    Finalized = 0,

    /// The object may be used.
    Live = 1,

    /// The object's dispose events or destructor are running.
    Finalizing = 2,
}

impl State
{
    fn from_u8(state: u8) -> Self
    {
        match state {
            1 => Self::Live,
            2 => Self::Finalizing,
            _ => Self::Finalized,
        }
    }
}

/// Why an object is being finalized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub (crate) enum Finalization
{
    /// By a collection. Objects with any kind of root are skipped.
    Collection,

    /// By the program. Roots are overridden,
    /// but temporary roots are waited for.
    Explicit,

    /// By destruction of the object.
    /// There cannot be any temporary roots.
    Destruction,
}

/// Bookkeeping shared by all managed objects.
pub struct Header
{
    state: AtomicU8,

    /// Roots and dispose events.
    ///
    /// Dispose events are invoked while this lock is held,
    /// so that deregistration waits for them.
    monitor: Mutex<Monitor>,

    /// Notified when the last temporary root is removed.
    unpinned: Condvar,
}

#[derive(Default)]
struct Monitor
{
    /// Roots that prevent finalization of any kind.
    temporary_roots: Option<NonZeroU64>,

    /// Roots that prevent collection only.
    roots: Option<NonZeroU64>,

    dispose_events: Vec<DisposeEvent>,
}

impl Header
{
    fn new(state: State) -> Self
    {
        Self{
            state: AtomicU8::new(state as u8),
            monitor: Mutex::new(Monitor::default()),
            unpinned: Condvar::new(),
        }
    }

    /// Lock the monitor.
    ///
    /// A panicking dispose event leaves the monitor consistent,
    /// so poisoning is ignored.
    fn monitor(&self) -> MutexGuard<Monitor>
    {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The identity of the object.
    pub fn id(&self) -> ObjectId
    {
        ObjectId::new(self)
    }

    /// The current state of the object.
    pub fn state(&self) -> State
    {
        State::from_u8(self.state.load(Acquire))
    }

    pub (super) fn set_state(&self, state: State)
    {
        self.state.store(state as u8, Release);
    }

    /// Whether the object has any temporary roots.
    pub fn is_pinned(&self) -> bool
    {
        self.monitor().temporary_roots.is_some()
    }

    /// Whether the object has any roots that prevent collection.
    pub fn is_rooted(&self) -> bool
    {
        self.monitor().roots.is_some()
    }

    pub (super) fn add_temporary_root(&self) -> bool
    {
        let mut monitor = self.monitor();
        if self.state() != State::Live {
            return false;
        }
        let Some(roots) = increment(monitor.temporary_roots) else {
            drop(monitor);
            panic!("Too many temporary roots");
        };
        monitor.temporary_roots = Some(roots);
        true
    }

    pub (super) fn remove_temporary_root(&self)
    {
        let mut monitor = self.monitor();
        // Unlock before panicking, so the monitor is not poisoned.
        let Some(roots) = monitor.temporary_roots else {
            drop(monitor);
            panic!("Temporary root removed more often than added");
        };
        monitor.temporary_roots = roots.decrement();
        if monitor.temporary_roots.is_none() {
            self.unpinned.notify_all();
        }
    }

    pub (super) fn add_root(&self) -> bool
    {
        let mut monitor = self.monitor();
        if self.state() != State::Live {
            return false;
        }
        let Some(roots) = increment(monitor.roots) else {
            drop(monitor);
            panic!("Too many roots");
        };
        monitor.roots = Some(roots);
        true
    }

    pub (super) fn remove_root(&self)
    {
        let mut monitor = self.monitor();
        let Some(roots) = monitor.roots else {
            drop(monitor);
            panic!("Root removed more often than added");
        };
        monitor.roots = roots.decrement();
    }

    pub (crate) fn register(&self, event: DisposeEvent) -> bool
    {
        let mut monitor = self.monitor();
        if self.state() != State::Live {
            return false;
        }
        monitor.dispose_events.push(event);
        true
    }

    pub (super) fn deregister(&self, event: DisposeEvent)
    {
        let mut monitor = self.monitor();
        let events = &mut monitor.dispose_events;
        if let Some(index) = events.iter().position(|&e| e == event) {
            events.remove(index);
        }
    }

    #[cfg(test)]
    pub (crate) fn dispose_event_count(&self) -> usize
    {
        self.monitor().dispose_events.len()
    }

    /// Move from live to finalizing and invoke the dispose events.
    ///
    /// Returns whether the object is now finalizing.
    fn begin_finalization(&self, reason: Finalization) -> bool
    {
        let mut monitor = self.monitor();

        if reason == Finalization::Explicit {
            monitor = self.unpinned
                .wait_while(monitor, |m| m.temporary_roots.is_some())
                .unwrap_or_else(PoisonError::into_inner);
        }

        if self.state() != State::Live {
            return false;
        }

        if reason == Finalization::Collection
            && (monitor.temporary_roots.is_some() || monitor.roots.is_some())
        {
            return false;
        }

        self.set_state(State::Finalizing);

        let events = take(&mut monitor.dispose_events);
        debug!("finalizing {:?} with {} dispose events", self.id(), events.len());
        for event in events {
            // SAFETY: Registrants keep their context valid
            //         until deregistration, which waits for us.
            unsafe { event.invoke(self.id()); }
        }

        true
    }
}

/// Add one to a root count, or return [`None`] on overflow.
fn increment(count: Option<NonZeroU64>) -> Option<NonZeroU64>
{
    count.map_or(Some(NonZeroU64::ONE), NonZeroExt::increment)
}

/// Managed object: a header followed by the value.
///
/// The value is only accessible through a [`PinnedRoot`],
/// so finalization never races with users of the value.
///
/// [`PinnedRoot`]: `super::PinnedRoot`
#[repr(C)]
pub struct Instance<C>
{
    header: Header,

    // INVARIANT: Initialized iff the state is live or finalizing.
    value: UnsafeCell<MaybeUninit<C>>,
}

// SAFETY: Access to the value is guarded by the state and temporary roots.
unsafe impl<C> Send for Instance<C> where C: Send { }
unsafe impl<C> Sync for Instance<C> where C: Send + Sync { }

impl<C> Instance<C>
{
    /// Create a live instance.
    pub fn new(value: C) -> Self
    {
        Self{
            header: Header::new(State::Live),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }

    /// Create an instance that is not yet constructed.
    ///
    /// The instance reports itself as finalized.
    pub fn unconstructed() -> Self
    {
        Self{
            header: Header::new(State::Finalized),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The header of the instance.
    pub fn header(&self) -> &Header
    {
        &self.header
    }

    /// The identity of the instance.
    pub fn id(&self) -> ObjectId
    {
        self.header.id()
    }

    /// Pointer to the value.
    pub (crate) fn value_ptr(&self) -> *mut MaybeUninit<C>
    {
        self.value.get()
    }

    /// Mark a constructed instance as live.
    ///
    /// # Safety
    ///
    /// The value must have been initialized.
    pub (crate) unsafe fn mark_constructed(&self)
    {
        self.header.set_state(State::Live);
    }

    /// Finalize the instance.
    ///
    /// Invokes the dispose events, drops the value,
    /// and zeroes its memory if `reset_memory` is set.
    /// See [`Finalization`] for how roots affect this.
    /// Returns whether this call finalized the instance.
    pub (crate) fn finalize(&self, reset_memory: bool, reason: Finalization)
        -> bool
    {
        if !self.header.begin_finalization(reason) {
            return false;
        }

        scope_exit! { self.header.set_state(State::Finalized); }

        let value = self.value.get();
        // SAFETY: Finalizing with no temporary roots,
        //         so nothing else can access the value.
        unsafe {
            ptr::drop_in_place((*value).as_mut_ptr());
            if reset_memory {
                ptr::write_bytes(value, 0, 1);
            }
        }

        true
    }
}

impl<C> Drop for Instance<C>
{
    fn drop(&mut self)
    {
        self.finalize(false, Finalization::Destruction);
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        std::{
            panic::{AssertUnwindSafe, catch_unwind},
            sync::{Arc, atomic::AtomicUsize},
            thread,
        },
    };

    use Finalization::*;

    unsafe fn count_disposal(context: *const (), _: ObjectId)
    {
        let counter = &*context.cast::<AtomicUsize>();
        counter.fetch_add(1, SeqCst);
    }

    #[test]
    fn finalization_invokes_events_once()
    {
        let counter = AtomicUsize::new(0);
        let context = &counter as *const AtomicUsize as *const ();
        let instance = Instance::new(String::from("value"));
        let event = DisposeEvent::new(count_disposal, context);

        assert!(instance.header().register(event));
        assert!(instance.finalize(true, Explicit));
        assert!(!instance.finalize(true, Explicit));
        assert_eq!(counter.load(SeqCst), 1);
        assert_eq!(instance.header().state(), State::Finalized);
        assert!(!instance.header().register(event));
        assert!(!instance.header().add_temporary_root());
    }

    #[test]
    fn deregistered_events_are_not_invoked()
    {
        let counter = AtomicUsize::new(0);
        let context = &counter as *const AtomicUsize as *const ();
        let instance = Instance::new(1u32);
        let event = DisposeEvent::new(count_disposal, context);

        assert!(instance.header().register(event));
        instance.header().deregister(event);
        instance.header().deregister(event);
        instance.finalize(false, Explicit);
        assert_eq!(counter.load(SeqCst), 0);
    }

    #[test]
    fn pinned_instances_are_skipped_unless_explicit()
    {
        let instance = Arc::new(Instance::new(vec![1, 2, 3]));
        assert!(instance.header().add_temporary_root());
        assert!(!instance.finalize(true, Collection));
        assert_eq!(instance.header().state(), State::Live);

        let other = instance.clone();
        let waiter = thread::spawn(move || other.finalize(true, Explicit));
        thread::yield_now();
        instance.header().remove_temporary_root();
        assert!(waiter.join().unwrap());
        assert_eq!(instance.header().state(), State::Finalized);
    }

    #[test]
    fn unconstructed_instances_are_finalized()
    {
        let instance = Instance::<String>::unconstructed();
        assert_eq!(instance.header().state(), State::Finalized);
        assert!(!instance.finalize(true, Explicit));
    }

    #[test]
    #[should_panic(expected = "Temporary root removed more often than added")]
    fn unbalanced_temporary_roots_panic()
    {
        Instance::new(()).header().remove_temporary_root();
    }

    #[test]
    fn roots_only_prevent_collection()
    {
        let instance = Instance::new(String::from("rooted"));
        assert!(instance.header().add_root());
        assert!(instance.header().add_root());
        assert!(instance.header().is_rooted());
        assert!(!instance.finalize(false, Collection));
        assert_eq!(instance.header().state(), State::Live);

        assert!(instance.finalize(false, Explicit));
        assert!(!instance.header().add_root());
        instance.header().remove_root();
        instance.header().remove_root();
        assert!(!instance.header().is_rooted());
    }

    #[test]
    fn unbalanced_removal_leaves_monitor_usable()
    {
        let instance = Instance::new(5u8);
        let result = catch_unwind(AssertUnwindSafe(|| {
            instance.header().remove_root();
        }));
        assert!(result.is_err());
        assert!(!instance.header().is_pinned());
        assert!(instance.header().add_temporary_root());
        instance.header().remove_temporary_root();
        assert!(instance.finalize(false, Explicit));
    }
}
