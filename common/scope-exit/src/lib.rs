//! Ad-hoc scope guards.

#![warn(missing_docs)]

use std::{mem::ManuallyDrop, thread};

/// When a scope guard performs its code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Trigger
{
    /// Whenever the scope ends, normally or by unwinding.
    Always,

    /// Only when the scope ends because a panic passes through.
    OnUnwind,
}

/// Scope guard that performs a function when dropped.
///
/// Usually created through [`scope_exit!`] or [`scope_failure!`].
pub struct ScopeGuard<F>
    where F: FnOnce()
{
    // INVARIANT: Initialized until dropped.
    f: ManuallyDrop<F>,
    trigger: Trigger,
}

impl<F> ScopeGuard<F>
    where F: FnOnce()
{
    fn new(trigger: Trigger, f: F) -> Self
    {
        Self{f: ManuallyDrop::new(f), trigger}
    }

    /// Create a guard that always performs `f`.
    pub fn always(f: F) -> Self
    {
        Self::new(Trigger::Always, f)
    }

    /// Create a guard that performs `f` only while unwinding.
    pub fn on_unwind(f: F) -> Self
    {
        Self::new(Trigger::OnUnwind, f)
    }
}

impl<F> Drop for ScopeGuard<F>
    where F: FnOnce()
{
    fn drop(&mut self)
    {
        // SAFETY: self.f will not be used anymore.
        let f = unsafe { ManuallyDrop::take(&mut self.f) };

        match self.trigger {
            Trigger::Always   => f(),
            Trigger::OnUnwind => if thread::panicking() { f() },
        }
    }
}

/// Define an ad-hoc scope guard.
///
/// The code passed to this macro is performed at the end of the scope.
/// It is performed when the scope ends or when a panic passes through.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_exit;
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     scope_exit! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
#[macro_export]
macro_rules! scope_exit
{
    { $($tt:tt)* } => {
        let __scope_exit = $crate::ScopeGuard::always(|| { $($tt)* });
    };
}

/// Define an ad-hoc scope guard that only fires on panic.
///
/// The code passed to this macro is performed only if
/// the scope is left because a panic passes through.
/// Normal exits from the scope leave the code unperformed.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_failure;
/// use std::{cell::Cell, panic::{AssertUnwindSafe, catch_unwind}};
/// let x = Cell::new(0);
/// {
///     scope_failure! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 2);
/// let _ = catch_unwind(AssertUnwindSafe(|| {
///     scope_failure! { x.set(3); }
///     panic!();
/// }));
/// assert_eq!(x.get(), 3);
/// ```
#[macro_export]
macro_rules! scope_failure
{
    { $($tt:tt)* } => {
        let __scope_failure = $crate::ScopeGuard::on_unwind(|| { $($tt)* });
    };
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        std::{cell::Cell, panic::{AssertUnwindSafe, catch_unwind}},
    };

    #[test]
    fn always_guard_runs_on_unwind()
    {
        let x = Cell::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            scope_exit! { x.set(1); }
            panic!("unwind");
        }));
        assert!(result.is_err());
        assert_eq!(x.get(), 1);
    }

    #[test]
    fn unwind_guard_skips_normal_exit()
    {
        let x = Cell::new(0);
        {
            let _guard = ScopeGuard::on_unwind(|| x.set(1));
        }
        assert_eq!(x.get(), 0);
    }
}
