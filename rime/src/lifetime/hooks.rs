use std::{mem::needs_drop, ptr};

/// Copy and destroy hooks of a type.
///
/// A copy hook turns a bitwise duplicate of a value into
/// an independent copy, like a copy constructor run after a memcpy.
/// A destroy hook releases whatever a value owns.
/// For aggregates, hooks visit the fields of the value in a fixed order:
/// copy hooks run field by field in declaration order, innermost first,
/// followed by the aggregate's own copy hook;
/// destroy hooks run the aggregate's own destroy hook first,
/// followed by the fields in reverse declaration order.
/// Array elements count as consecutive fields.
///
/// Implementations for aggregates are generated with [`impl_hooks!`].
///
/// # Safety
///
/// If [`ELABORATE_COPY`] is false, a bitwise copy of a value
/// must be independent of the original, so that both may be destroyed.
/// If [`ELABORATE_DESTROY`] is false, destroying a value must be a no-op.
/// After [`invoke_copy_hooks`] on a bitwise copy,
/// the copy must be independent of the original.
///
/// [`ELABORATE_COPY`]: `Self::ELABORATE_COPY`
/// [`ELABORATE_DESTROY`]: `Self::ELABORATE_DESTROY`
/// [`invoke_copy_hooks`]: `Self::invoke_copy_hooks`
/// [`impl_hooks!`]: `crate::impl_hooks`
pub unsafe trait Hooks: Sized
{
    /// Whether the type has a nontrivial copy hook.
    const ELABORATE_COPY: bool = false;

    /// Whether the type has a nontrivial destroy hook.
    const ELABORATE_DESTROY: bool = needs_drop::<Self>();

    /// Run the copy hooks of a bitwise duplicate.
    ///
    /// Calling this on a value that is not a duplicate
    /// leaks whatever the value owned.
    fn invoke_copy_hooks(&mut self)
    {
    }

    /// Run the destroy hooks of a value.
    ///
    /// # Safety
    ///
    /// Afterwards the value must not be used or dropped
    /// until it is overwritten without dropping it.
    unsafe fn invoke_destroy_hooks(&mut self)
    {
        ptr::drop_in_place(self);
    }
}

macro_rules! trivial_hooks
{
    { $($ty:ty,)* } => {
        $(
            // SAFETY: Plain values own nothing.
            unsafe impl Hooks for $ty { }
        )*
    };
}

trivial_hooks!
{
    (),
    bool, char,
    u8, u16, u32, u64, u128, usize,
    i8, i16, i32, i64, i128, isize,
    f32, f64,
}

// SAFETY: Pointers and shared references own nothing.
unsafe impl<T: ?Sized> Hooks for *const T { }
unsafe impl<T: ?Sized> Hooks for *mut T { }
unsafe impl<T: ?Sized> Hooks for ptr::NonNull<T> { }
unsafe impl<'a, T: ?Sized> Hooks for &'a T { }

// SAFETY: Forwards to the contained value.
unsafe impl<T> Hooks for Option<T>
    where T: Hooks
{
    const ELABORATE_COPY: bool = T::ELABORATE_COPY;
    const ELABORATE_DESTROY: bool = T::ELABORATE_DESTROY;

    fn invoke_copy_hooks(&mut self)
    {
        if let Some(value) = self {
            value.invoke_copy_hooks();
        }
    }

    unsafe fn invoke_destroy_hooks(&mut self)
    {
        if let Some(value) = self {
            value.invoke_destroy_hooks();
        }
    }
}

// SAFETY: Forwards to each element.
unsafe impl<T, const N: usize> Hooks for [T; N]
    where T: Hooks
{
    const ELABORATE_COPY: bool = T::ELABORATE_COPY;
    const ELABORATE_DESTROY: bool = T::ELABORATE_DESTROY;

    fn invoke_copy_hooks(&mut self)
    {
        if T::ELABORATE_COPY {
            self.iter_mut().for_each(T::invoke_copy_hooks);
        }
    }

    unsafe fn invoke_destroy_hooks(&mut self)
    {
        if T::ELABORATE_DESTROY {
            for element in self.iter_mut().rev() {
                element.invoke_destroy_hooks();
            }
        }
    }
}

macro_rules! tuple_hooks
{
    { $(($($field:tt $ty:ident)*) ($($rev:tt)*),)* } => {
        $(
            // SAFETY: Forwards to each field.
            unsafe impl<$($ty),*> Hooks for ($($ty,)*)
                where $($ty: Hooks),*
            {
                const ELABORATE_COPY: bool =
                    false $(|| $ty::ELABORATE_COPY)*;
                const ELABORATE_DESTROY: bool =
                    false $(|| $ty::ELABORATE_DESTROY)*;

                fn invoke_copy_hooks(&mut self)
                {
                    $(self.$field.invoke_copy_hooks();)*
                }

                unsafe fn invoke_destroy_hooks(&mut self)
                {
                    $(self.$rev.invoke_destroy_hooks();)*
                }
            }
        )*
    };
}

tuple_hooks!
{
    (0 A) (0),
    (0 A 1 B) (1 0),
    (0 A 1 B 2 C) (2 1 0),
    (0 A 1 B 2 C 3 D) (3 2 1 0),
    (0 A 1 B 2 C 3 D 4 E) (4 3 2 1 0),
    (0 A 1 B 2 C 3 D 4 E 5 F) (5 4 3 2 1 0),
}

macro_rules! cloning_hooks
{
    { $(impl<$($param:ident),*> for $ty:ty;)* } => {
        $(
            // SAFETY: The copy hook replaces the duplicate with a clone.
            unsafe impl<$($param),*> Hooks for $ty
                where $ty: Clone
            {
                const ELABORATE_COPY: bool = true;
                const ELABORATE_DESTROY: bool = true;

                fn invoke_copy_hooks(&mut self)
                {
                    let copy = self.clone();
                    // SAFETY: The duplicate is not dropped,
                    //         because the original owns its contents.
                    unsafe { ptr::write(self, copy); }
                }
            }
        )*
    };
}

cloning_hooks!
{
    impl<T> for Box<T>;
    impl<T> for Vec<T>;
    impl<> for String;
}

/// Implement [`Hooks`] for a struct from its fields.
///
/// The struct's own hooks are optional functions taking `&mut Self`.
/// The own destroy hook runs only through
/// [`invoke_destroy_hooks`][`Hooks::invoke_destroy_hooks`],
/// not when the struct is dropped normally,
/// so structs using it should not also implement [`Drop`].
///
/// The `unsafe` keyword acknowledges the safety contract of [`Hooks`]:
/// the own copy hook must make a bitwise duplicate independent.
///
/// # Examples
///
/// ```
/// use rime::{impl_hooks, lifetime::Hooks};
///
/// #[derive(Default)]
/// struct Pair { name: String, values: [u32; 4] }
///
/// impl_hooks! {
///     unsafe Pair { name: String, values: [u32; 4] }
/// }
///
/// assert!(Pair::ELABORATE_COPY);
/// ```
#[macro_export]
macro_rules! impl_hooks
{
    {
        unsafe $ty:ty { $($field:ident : $fty:ty),* $(,)? }
        $(copy = $copy:expr;)?
        $(destroy = $destroy:expr;)?
    } => {
        // SAFETY: Acknowledged by the caller.
        unsafe impl $crate::lifetime::Hooks for $ty
        {
            const ELABORATE_COPY: bool =
                $crate::impl_hooks!(@present $($copy)?)
                $(|| <$fty as $crate::lifetime::Hooks>::ELABORATE_COPY)*;

            const ELABORATE_DESTROY: bool =
                $crate::impl_hooks!(@present $($destroy)?)
                $(|| <$fty as $crate::lifetime::Hooks>::ELABORATE_DESTROY)*;

            fn invoke_copy_hooks(&mut self)
            {
                $($crate::lifetime::Hooks::invoke_copy_hooks(&mut self.$field);)*
                $(($copy)(self);)?
            }

            unsafe fn invoke_destroy_hooks(&mut self)
            {
                $(($destroy)(self);)?
                $crate::impl_hooks!(@reverse self; $($field)*);
            }
        }
    };

    { @present } => { false };
    { @present $e:expr } => { true };

    { @reverse $this:tt; } => { };
    { @reverse $this:tt; $head:ident $($tail:ident)* } => {
        $crate::impl_hooks!(@reverse $this; $($tail)*);
        $crate::lifetime::Hooks::invoke_destroy_hooks(&mut $this.$head);
    };
}
