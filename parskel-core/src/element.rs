//! Values that can be moved between host memory and device memory.

use std::fmt::Debug;
use std::mem::size_of;
use std::{ptr, slice};

/// Types which can be stored in device buffers.
///
/// Device memory is untyped, so data is shipped to and from devices as raw bytes. This trait
/// marks the types for which that is sound.
///
/// # Safety
/// * The type must be `Copy` (No Drop implementation).
/// * The type must be `Send` and `Sync` (Possible to copy between threads via device memory).
/// * Any possible bit-pattern must be a valid value, since a faulty kernel can write anything.
///   This is the reason why `bool` and `char` are not `Element`.
/// * The type must not contain padding bytes, since its bytes are read as a `&[u8]`. This is
///   the reason why tuples are not `Element`.
pub unsafe trait Element: Copy + Default + Debug + Send + Sync + Sized + 'static {
    /// Size of one element in bytes.
    #[inline(always)]
    fn size_in_bytes() -> usize {
        size_of::<Self>()
    }
}

macro_rules! impl_element_type {
    (@prim $($t:ty)*) => {
        $(
            unsafe impl Element for $t { }
        )*
    };
    (@array $($n:expr)*) => {
        $(
            unsafe impl <T: Element> Element for [T; $n] where [T; $n]: Default { }
        )*
    };
}

impl_element_type!(@prim i8 i16 i32 i64 isize u8 u16 u32 u64 usize f32 f64);
impl_element_type!(@array 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16);

/// View a slice of elements as raw bytes.
#[inline]
pub fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: `Element` types contain no padding and any initialized value is valid bytes.
    unsafe { slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * size_of::<T>()) }
}

/// Copy a slice of elements into a newly allocated byte buffer.
#[inline]
pub fn to_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    as_bytes(data).to_vec()
}

/// Copy raw bytes into a slice of elements. The number of bytes must match exactly.
pub fn copy_from_bytes<T: Element>(bytes: &[u8], output: &mut [T]) {
    assert_eq!(
        bytes.len(),
        output.len() * size_of::<T>(),
        "byte count does not match element count"
    );

    // SAFETY: lengths are checked above and any bit pattern is a valid `Element`.
    unsafe {
        ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            output.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
    }
}

/// Convert raw bytes into a vector of elements.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    assert_eq!(bytes.len() % size_of::<T>(), 0, "misaligned byte count");
    let mut output = vec![T::default(); bytes.len() / size_of::<T>()];
    copy_from_bytes(bytes, &mut output);
    output
}

/// Read the element at position `index` from an unaligned byte buffer.
#[inline]
pub fn load_element<T: Element>(bytes: &[u8], index: usize) -> T {
    let start = index * size_of::<T>();
    let end = start + size_of::<T>();
    assert!(
        end <= bytes.len(),
        "index {} out of bounds for buffer of {} bytes",
        index,
        bytes.len()
    );

    // SAFETY: bounds are checked above and any bit pattern is a valid `Element`.
    unsafe { ptr::read_unaligned(bytes[start..end].as_ptr() as *const T) }
}

/// Write the element at position `index` into an unaligned byte buffer.
#[inline]
pub fn store_element<T: Element>(bytes: &mut [u8], index: usize, value: T) {
    let start = index * size_of::<T>();
    let end = start + size_of::<T>();
    assert!(
        end <= bytes.len(),
        "index {} out of bounds for buffer of {} bytes",
        index,
        bytes.len()
    );

    // SAFETY: bounds are checked above.
    unsafe { ptr::write_unaligned(bytes[start..end].as_mut_ptr() as *mut T, value) }
}

pub trait Zero {
    fn zero() -> Self;
}

pub trait One {
    fn one() -> Self;
}

macro_rules! impl_one_zero {
    ($($t:ident)*) => {
        $(
        impl One for $t {
            fn one() -> Self { 1 as $t }
        }

        impl Zero for $t {
            fn zero() -> Self { 0 as $t }
        }
        )*
    }
}

impl_one_zero!(i8 i16 i32 i64 isize u8 u16 u32 u64 usize f32 f64);
