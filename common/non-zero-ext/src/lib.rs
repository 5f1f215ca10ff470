//! Extra methods for non-zero integers.
//!
//! These are used for counters that are removed from a table
//! when they would reach zero, such as temporary root counts.

#![warn(missing_docs)]

use std::num::NonZeroU64;

/// Extra methods for non-zero integers.
pub trait NonZeroExt: Sized
{
    /// The number 1.
    const ONE: Self;

    /// Add one, or return [`None`] on overflow.
    fn increment(self) -> Option<Self>;

    /// Subtract one, or return [`None`] if the result would be zero.
    fn decrement(self) -> Option<Self>;
}

macro_rules! non_zero_ext
{
    { $($ty:ty,)* } => {
        $(
            impl NonZeroExt for $ty
            {
                const ONE: Self = match Self::new(1) {
                    Some(one) => one,
                    None      => unreachable!(),
                };

                fn increment(self) -> Option<Self>
                {
                    self.checked_add(1)
                }

                fn decrement(self) -> Option<Self>
                {
                    Self::new(self.get() - 1)
                }
            }
        )*
    };
}

non_zero_ext!
{
    NonZeroU64,
}
