//! Collection of utility functions.

pub use self::future::*;
use crate::{One, Zero};
use std::ops::{Add, Div, Mul, Rem};

mod future;

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 =  4.2` thus
/// `div_ceil(21,5) == 5`.
pub fn div_ceil<T>(x: T, y: T) -> T
where
    T: One + Zero + Div<Output = T> + Rem<Output = T> + Add<Output = T> + PartialOrd + Copy,
{
    let (q, r) = (x / y, x % y);
    if r != T::zero() && (x >= T::zero()) == (y >= T::zero()) {
        q + T::one()
    } else {
        q
    }
}

/// Round `x` up to the next multiple of `y`.
pub fn round_up<T>(x: T, y: T) -> T
where
    T: One
        + Zero
        + Div<Output = T>
        + Rem<Output = T>
        + Add<Output = T>
        + PartialOrd
        + Copy
        + Mul<Output = T>,
{
    div_ceil(x, y) * y
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_div_ceil() {
        // Div ceil is tricky to get right for negative numbers.
        assert_eq!(div_ceil(-1, 5), 0);
        assert_eq!(div_ceil(0, 5), 0);
        assert_eq!(div_ceil(1, 5), 1);

        assert_eq!(div_ceil(9, 5), 2);
        assert_eq!(div_ceil(10, 5), 2);
        assert_eq!(div_ceil(11, 5), 3);

        assert_eq!(div_ceil(-9, -5), 2);
        assert_eq!(div_ceil(9, -5), -1);
        assert_eq!(div_ceil(-11, 5), -2);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0usize, 16), 0);
        assert_eq!(round_up(1usize, 16), 16);
        assert_eq!(round_up(16usize, 16), 16);
        assert_eq!(round_up(17usize, 16), 32);
    }
}
