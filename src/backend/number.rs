// src/backend/number.rs

use ndarray::{LinalgScalar, ScalarOperand};
use rand_distr::num_traits::{FromPrimitive, One, Zero};
use std::cmp::{PartialEq, PartialOrd};
use std::default::Default;
use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, Sub, SubAssign};

/// Base trait for all numeric element types in Gradix.
/// Provides a common interface for arithmetic, comparison and conversion so
/// graph code never needs to know the concrete element type. Unsigned
/// integers are excluded: negation and signum have no meaning for them.
pub trait GradixN:
    Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + Div<Output = Self>
    + Sum<Self> + for<'a> Sum<&'a Self>
    + AddAssign + SubAssign + MulAssign + DivAssign
    + Rem<Output = Self>
    + Neg<Output = Self>
    + PartialOrd + PartialEq
    + Clone + Copy + Debug + Display + Default
    + Sized
    + Zero
    + One
    + FromPrimitive
    + LinalgScalar + ScalarOperand + 'static
{
    /// Neutral element for addition (zero)
    fn zero() -> Self;

    /// Neutral element for multiplication (one)
    fn one() -> Self;

    /// Checks if the value is zero
    fn is_zero(&self) -> bool {
        *self == <Self as GradixN>::zero()
    }

    /// Absolute value
    fn abs(self) -> Self;

    /// Sign of the number (-1, 0, 1)
    fn signum(self) -> Self;

    fn max(self, other: Self) -> Self {
        if self >= other {
            return self;
        }
        other
    }

    fn min(self, other: Self) -> Self {
        if self <= other {
            return self;
        }
        other
    }

    /// Converts to f64 for operations that require floating point
    fn to_f64(self) -> f64;

    /// Converts from f64 (may fail for integer types if there's precision loss)
    fn from_f64(value: f64) -> Option<Self>;

    /// Converts from usize (may fail if the value does not fit exactly)
    fn from_usize(value: usize) -> Option<Self>;

    /// Minimum value representable by this type
    fn min_value() -> Self;

    /// Maximum value representable by this type
    fn max_value() -> Self;
}

/// Floating-point element trait. Differentiation needs transcendental
/// functions (`ln`, `powf`) and an epsilon for numeric perturbation, so the
/// autodiff engine is bounded on this rather than on `GradixN`.
pub trait GradixF: GradixN {
    /// Square root
    fn sqrt(self) -> Self;

    /// Exponential function (e^x)
    fn exp(self) -> Self;

    /// Natural logarithm
    fn ln(self) -> Self;

    /// Power with floating-point exponent
    fn powf(self, exp: Self) -> Self;

    /// Checks if it's NaN
    fn is_nan(self) -> bool;

    /// Checks if it's finite
    fn is_finite(self) -> bool;

    /// Epsilon for floating-point comparisons and numeric differentiation
    fn epsilon() -> Self;
}

// ============= GRADIXN IMPLEMENTATIONS =============

impl GradixN for f64 {
    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn abs(self) -> Self {
        self.abs()
    }

    fn signum(self) -> Self {
        self.signum()
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Option<Self> {
        Some(value)
    }

    fn from_usize(value: usize) -> Option<Self> {
        Some(value as f64)
    }

    fn min_value() -> Self {
        f64::MIN
    }

    fn max_value() -> Self {
        f64::MAX
    }
}

impl GradixF for f64 {
    fn sqrt(self) -> Self {
        self.sqrt()
    }

    fn exp(self) -> Self {
        self.exp()
    }

    fn ln(self) -> Self {
        self.ln()
    }

    fn powf(self, exp: Self) -> Self {
        self.powf(exp)
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }

    fn is_finite(self) -> bool {
        self.is_finite()
    }

    fn epsilon() -> Self {
        f64::EPSILON
    }
}

impl GradixN for f32 {
    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn abs(self) -> Self {
        self.abs()
    }

    fn signum(self) -> Self {
        self.signum()
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() && value >= f32::MIN as f64 && value <= f32::MAX as f64 {
            Some(value as f32)
        } else {
            None
        }
    }

    fn from_usize(value: usize) -> Option<Self> {
        // usize values up to 2^24 can be exactly represented in f32
        if value <= (1 << 24) {
            Some(value as f32)
        } else {
            None
        }
    }

    fn min_value() -> Self {
        f32::MIN
    }

    fn max_value() -> Self {
        f32::MAX
    }
}

impl GradixF for f32 {
    fn sqrt(self) -> Self {
        self.sqrt()
    }

    fn exp(self) -> Self {
        self.exp()
    }

    fn ln(self) -> Self {
        self.ln()
    }

    fn powf(self, exp: Self) -> Self {
        self.powf(exp)
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }

    fn is_finite(self) -> bool {
        self.is_finite()
    }

    fn epsilon() -> Self {
        f32::EPSILON
    }
}
