use {
    super::{Hooks, raw_copy},
    scope_exit::scope_failure,
    std::{array, mem::MaybeUninit, ptr},
};

/// Construct a value in uninitialized memory by conversion.
///
/// This is the in-place counterpart of `let t: T = arg.into();`.
pub fn construct_in_place<T, A>(slot: &mut MaybeUninit<T>, arg: A) -> &mut T
    where A: Into<T>
{
    slot.write(arg.into())
}

/// Construct a copy of a value in uninitialized memory.
///
/// The value is copied bitwise and then its copy hooks are invoked,
/// exactly as if it had been copy-constructed.
pub fn copy_construct_in_place<'a, T>(slot: &'a mut MaybeUninit<T>, source: &T)
    -> &'a mut T
    where T: Hooks
{
    // SAFETY: The slot is valid for writes and does not overlap source.
    //         By the contract of Hooks, the copy hooks
    //         make the duplicate independent of the source.
    unsafe {
        raw_copy(source, slot.as_mut_ptr());
        let copy = slot.assume_init_mut();
        copy.invoke_copy_hooks();
        copy
    }
}

/// Values that can be built by broadcasting a scalar
/// into every element of nested arrays.
pub trait Splat<A>: Sized
{
    /// Broadcast `arg` into a new value.
    fn splat(arg: A) -> Self;
}

macro_rules! splat_scalars
{
    { $($ty:ty,)* } => {
        $(
            impl<A> Splat<A> for $ty
                where A: Into<$ty>
            {
                fn splat(arg: A) -> Self
                {
                    arg.into()
                }
            }
        )*
    };
}

splat_scalars!
{
    bool, char,
    u8, u16, u32, u64, u128, usize,
    i8, i16, i32, i64, i128, isize,
    f32, f64,
}

impl<T, A, const N: usize> Splat<A> for [T; N]
    where T: Splat<A>, A: Clone
{
    fn splat(arg: A) -> Self
    {
        array::from_fn(|_| T::splat(arg.clone()))
    }
}

/// Construct nested arrays in uninitialized memory
/// from an argument convertible to their innermost element type.
///
/// # Examples
///
/// ```
/// use {rime::lifetime::splat_in_place, std::mem::MaybeUninit};
/// let mut slot = MaybeUninit::<[[u32; 2]; 3]>::uninit();
/// assert_eq!(*splat_in_place(&mut slot, 7u8), [[7; 2]; 3]);
/// ```
pub fn splat_in_place<T, A>(slot: &mut MaybeUninit<T>, arg: A) -> &mut T
    where T: Splat<A>
{
    slot.write(T::splat(arg))
}

/// Types with a constructor taking `Args`.
///
/// Construction starts from the default value of the type,
/// which the constructor then modifies.
/// Every default-constructible type has
/// a constructor that takes no arguments.
/// Constructors that assign each field from the corresponding argument
/// are generated with [`impl_construct_fields!`].
///
/// [`impl_construct_fields!`]: `crate::impl_construct_fields`
pub trait Construct<Args>: Default
{
    /// Run the constructor on a default-initialized value.
    fn construct(&mut self, args: Args);
}

impl<T> Construct<()> for T
    where T: Default
{
    fn construct(&mut self, (): ())
    {
    }
}

/// Construct a value in uninitialized memory from constructor arguments.
///
/// The memory is default-initialized before the constructor runs.
/// If the constructor panics, the partially constructed value is dropped
/// and the memory is left uninitialized.
pub fn construct_in_place_from_args<T, Args>(
    slot: &mut MaybeUninit<T>,
    args: Args,
) -> &mut T
    where T: Construct<Args>
{
    let value = slot.as_mut_ptr();

    // SAFETY: The slot is valid for writes.
    unsafe { value.write(T::default()); }

    {
        scope_failure! {
            // SAFETY: The value was initialized above.
            unsafe { ptr::drop_in_place(value); }
        }

        // SAFETY: The value was initialized above.
        unsafe { (*value).construct(args); }
    }

    // SAFETY: The value was initialized above.
    unsafe { &mut *value }
}

/// Implement [`Construct`] for a struct by assigning its fields.
///
/// The generated constructor takes a tuple with one argument per field,
/// in the order given, and converts each with [`Into`].
///
/// # Examples
///
/// ```
/// use {
///     rime::{impl_construct_fields, lifetime::construct_in_place_from_args},
///     std::mem::MaybeUninit,
/// };
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Point { x: i64, y: i64 }
///
/// impl_construct_fields! { Point { x: i64, y: i64 } }
///
/// let mut slot = MaybeUninit::<Point>::uninit();
/// let point = construct_in_place_from_args(&mut slot, (1i32, 2u8));
/// assert_eq!(*point, Point{x: 1, y: 2});
/// ```
#[macro_export]
macro_rules! impl_construct_fields
{
    { $ty:ty { $($field:ident : $fty:ty),* $(,)? } } => {
        #[allow(non_camel_case_types)]
        impl<$($field),*> $crate::lifetime::Construct<($($field,)*)> for $ty
            where $($field: ::std::convert::Into<$fty>),*
        {
            fn construct(&mut self, ($($field,)*): ($($field,)*))
            {
                $(self.$field = $field.into();)*
            }
        }
    };
}
