//! Generic bounds for the index and scalar types the kernels are built over.
//!
//! The original implementation is a C++ template over an index type `I` and
//! a value type `D` (spec.md §9: "template parameterization over index and
//! value types"). Rust encodes that as two small traits rather than
//! monomorphized code generation.

use num_traits::{Float, PrimInt, Signed, Zero};
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Sub};

/// A global or local array index.
///
/// Implemented for the signed and unsigned integer widths the partitioner
/// and matrix/vector storage are built over. Negative values are only
/// meaningful for the signed widths, used to test the "negative size"
/// invalid-size error case (spec.md §8).
pub trait Index:
    PrimInt + Signed + Add<Output = Self> + Sub<Output = Self> + AddAssign + Debug + 'static
{
    /// Convert to a `usize` for indexing into local storage. Panics if the
    /// value doesn't fit, which cannot happen for any index this crate
    /// itself produces (partitions and local offsets are always in range).
    fn as_usize(self) -> usize;

    /// Convert a `usize` back into this index type.
    fn from_usize(v: usize) -> Self;

    /// Convert to `i64`, used only for error messages (can't use
    /// `as_usize` there since the value may be negative).
    fn as_i64(self) -> i64;
}

macro_rules! impl_index {
    ($($t:ty),*) => {
        $(
            impl Index for $t {
                fn as_usize(self) -> usize {
                    self.to_usize().expect("index out of range for usize")
                }
                fn from_usize(v: usize) -> Self {
                    <$t as num_traits::NumCast>::from(v).expect("usize out of range for index type")
                }
                fn as_i64(self) -> i64 {
                    self as i64
                }
            }
        )*
    };
}

impl_index!(i32, i64);

/// A dense-vector / matrix value type.
///
/// The source leaves `std::complex` support unfinished (spec.md §1
/// Non-goals); this trait is bounded for real scalars only.
pub trait Scalar: Copy + Zero + Add<Output = Self> + AddAssign + Debug + 'static {
    /// `|self|^2`, collapsing to `self * self` for real types (spec.md §4.3,
    /// `Vec::norm`). Named to leave room for a complex impl later without
    /// renaming the contract.
    fn mag_sq(self) -> Self;

    fn mul(self, other: Self) -> Self;
}

macro_rules! impl_scalar_float {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                fn mag_sq(self) -> Self {
                    self * self
                }
                fn mul(self, other: Self) -> Self {
                    self * other
                }
            }
        )*
    };
}

impl_scalar_float!(f32, f64);

/// Marker bound used by `Vec::norm`'s `sqrt()` call.
pub trait RealScalar: Scalar + Float {}
impl<T: Scalar + Float> RealScalar for T {}
