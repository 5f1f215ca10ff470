use {
    super::{Construct, construct_in_place_from_args},
    crate::heap::{Finalization, Instance, State},
    log::trace,
    std::mem::MaybeUninit,
};

/// Construct a managed object in caller-supplied memory.
///
/// The value is default-initialized and then constructed from `args`.
/// The instance becomes live only once construction completes;
/// if construction panics, the instance stays unconstructed.
pub fn construct_class_in_place<C, Args>(
    memory: &mut MaybeUninit<Instance<C>>,
    args: Args,
) -> &mut Instance<C>
    where C: Construct<Args>
{
    let instance = memory.write(Instance::unconstructed());

    // SAFETY: The instance is unconstructed, so nothing else
    //         can access the value, and we have exclusive access.
    let value = unsafe { &mut *instance.value_ptr() };
    construct_in_place_from_args(value, args);

    // SAFETY: Just constructed.
    unsafe { instance.mark_constructed(); }

    trace!("constructed {:?} in place", instance.id());
    instance
}

/// Finalize an object immediately.
///
/// The object's dispose events are invoked and its value is dropped.
/// If `reset_memory` is set, the value's memory is also zeroed.
/// Afterwards the object is marked finalized,
/// so pinning it fails from then on.
///
/// Roots that only hold off collection, such as those of
/// a hard [`WeakReferenceArray`], do not delay this.
/// If the object is pinned, this waits for its temporary roots
/// to be removed, so it must not be called while holding
/// a pinned root to the same object.
/// Finalizing an object that is already finalized does nothing.
///
/// [`WeakReferenceArray`]: `crate::weakref::WeakReferenceArray`
pub fn finalize_instance<C>(object: &Instance<C>, reset_memory: bool)
{
    object.finalize(reset_memory, Finalization::Explicit);
}

/// Whether an object was finalized or never constructed.
pub fn is_finalized<C>(object: &Instance<C>) -> bool
{
    object.header().state() == State::Finalized
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::heap::{DisposeEvent, ObjectId},
        std::sync::atomic::{AtomicBool, Ordering::SeqCst},
    };

    #[derive(Debug, Default, PartialEq)]
    struct Account
    {
        owner: String,
        balance: i64,
    }

    impl Construct<(&str, i64)> for Account
    {
        fn construct(&mut self, (owner, balance): (&str, i64))
        {
            self.owner = owner.to_owned();
            self.balance = balance;
        }
    }

    unsafe fn set_flag(context: *const (), _: ObjectId)
    {
        (*context.cast::<AtomicBool>()).store(true, SeqCst);
    }

    #[test]
    fn constructed_instances_are_live()
    {
        let mut memory = MaybeUninit::<Instance<Account>>::uninit();
        let instance = construct_class_in_place(&mut memory, ("ada", 10i64));
        assert!(!is_finalized(instance));
        assert_eq!(instance.header().state(), State::Live);

        let flag = AtomicBool::new(false);
        let event = DisposeEvent::new(set_flag, &flag as *const _ as *const ());
        assert!(instance.header().register(event));

        finalize_instance(instance, true);
        assert!(is_finalized(instance));
        assert!(flag.load(SeqCst));

        // The value's memory was zeroed.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                instance.value_ptr().cast::<u8>(),
                std::mem::size_of::<Account>(),
            )
        };
        assert!(bytes.iter().all(|&b| b == 0));

        finalize_instance(instance, true);
        unsafe { memory.assume_init_drop(); }
    }

    #[test]
    fn default_construction_needs_no_arguments()
    {
        let mut memory = MaybeUninit::<Instance<Account>>::uninit();
        let instance = construct_class_in_place(&mut memory, ());
        let pinned = instance.header().is_pinned();
        assert!(!pinned);
        finalize_instance(instance, false);
        unsafe { memory.assume_init_drop(); }
    }
}
