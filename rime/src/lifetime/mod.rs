//! Construction, copying, moving, and destruction of values in raw storage.
//!
//! These functions mirror what a compiler emits for initialization,
//! copy construction, assignment by move, and scope exit.
//! None of them allocate memory.
//!
//! Copy and destroy behavior is described by the [`Hooks`] trait.
//! Moving is done by copying bits and, for types with elaborate hooks,
//! resetting the source to its default value,
//! so that every value is destroyed exactly once.

pub use self::{construct::*, finalize::*, hooks::*, raw_copy::*};

use std::{mem::MaybeUninit, ptr};

mod construct;
mod finalize;
mod hooks;
mod raw_copy;

/// Overwrite raw storage with the default value of `T`.
///
/// The previous contents of the storage are not dropped;
/// they may be uninitialized or already destroyed.
///
/// # Safety
///
/// `t` must be valid for writes and aligned for `T`.
pub unsafe fn reset_to_default<T>(t: *mut T)
    where T: Default
{
    t.write(T::default());
}

/// Initialize storage with the default value of `T`.
pub fn initialize_in_place<T>(slot: &mut MaybeUninit<T>) -> &mut T
    where T: Default
{
    slot.write(T::default())
}

/// Run the copy hooks of a bitwise duplicate.
///
/// See [`Hooks::invoke_copy_hooks`].
pub fn invoke_copy_hooks<T>(t: &mut T)
    where T: Hooks
{
    t.invoke_copy_hooks();
}

/// Run the destroy hooks of a value.
///
/// See [`Hooks::invoke_destroy_hooks`].
///
/// # Safety
///
/// Afterwards `t` must not be used or dropped
/// until it is overwritten without dropping it.
pub unsafe fn invoke_destroy_hooks<T>(t: &mut T)
    where T: Hooks
{
    t.invoke_destroy_hooks();
}

/// Destroy a value, optionally resetting it to its default value.
///
/// If `reset_after` is not set, the storage is left with
/// whatever the destroy hooks left behind, which may not be a valid `T`.
///
/// # Safety
///
/// `t` must be valid for reads and writes and hold an initialized value.
/// If `reset_after` is not set, the storage must afterwards be
/// treated as uninitialized.
pub unsafe fn destruct_in_place<T>(t: *mut T, reset_after: bool)
    where T: Hooks + Default
{
    (*t).invoke_destroy_hooks();
    if reset_after {
        reset_to_default(t);
    }
}

/// Whether moving from a value must reset the source.
const fn is_elaborate<T>() -> bool
    where T: Hooks
{
    T::ELABORATE_COPY || T::ELABORATE_DESTROY
}

/// Move the value at `source` into `target`.
///
/// Does nothing if both point to the same storage.
/// Otherwise the value at `target` is destroyed if it has a destroy hook,
/// the bits of `source` are copied into `target`, and if `T` has
/// an elaborate copy or destroy hook, `source` is reset to its default.
/// Sources of other types are left unchanged,
/// since a duplicate of such a value is harmless.
///
/// Destroy hooks must not panic.
///
/// # Safety
///
/// Both pointers must be valid for reads and writes,
/// hold initialized values, and must not partially overlap.
pub unsafe fn move_into<T>(source: *mut T, target: *mut T)
    where T: Hooks + Default
{
    if ptr::eq(source, target) {
        return;
    }

    // Computed up front, so that a panic cannot leave two owners.
    let fresh = is_elaborate::<T>().then(T::default);

    if T::ELABORATE_DESTROY {
        (*target).invoke_destroy_hooks();
    }

    raw_copy(source, target);

    if let Some(fresh) = fresh {
        source.write(fresh);
    }
}

/// Move a value into another, destroying the latter's old value.
///
/// See [`move_into`].
pub fn move_value<T>(source: &mut T, target: &mut T)
    where T: Hooks + Default
{
    // SAFETY: Distinct mutable references do not overlap.
    unsafe { move_into(source, target); }
}

/// Move a value out of its storage.
///
/// Like [`move_into`], the source is reset to its default value
/// only if `T` has elaborate hooks.
pub fn move_out<T>(source: &mut T) -> T
    where T: Hooks + Default
{
    if is_elaborate::<T>() {
        std::mem::take(source)
    } else {
        // SAFETY: By the contract of Hooks,
        //         the duplicate is independent of the source.
        unsafe { ptr::read(source) }
    }
}
