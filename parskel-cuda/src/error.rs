//! Status codes of the driver API.

use cuda_driver_sys::*;
use std::error::Error as StdError;
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::num::NonZeroU32;
use std::{fmt, mem, str};

/// Convert a `CUresult` into `Ok(())` or `Err(Error)`.
#[inline(always)]
pub fn cuda_check(code: CUresult) -> Result {
    Error::new(code)
}

/// Call a driver function that writes its output through a pointer, returning the output on
/// success.
///
/// # Safety
/// The closure must initialize the value behind the pointer whenever it returns
/// `CUDA_SUCCESS`.
#[inline(always)]
pub unsafe fn cuda_call<T, F>(fun: F) -> Result<T>
where
    F: FnOnce(*mut T) -> CUresult,
{
    let mut output = MaybeUninit::uninit();
    Error::new(fun(output.as_mut_ptr()))?;
    Ok(output.assume_init())
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Failed `CUresult`. `CUDA_SUCCESS` is zero, so every error code is non-zero.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Error(NonZeroU32);

impl Error {
    #[inline(always)]
    pub fn new(code: CUresult) -> Result<(), Self> {
        if code == CUresult::CUDA_SUCCESS {
            Ok(())
        } else {
            // SAFETY: `code` is not `CUDA_SUCCESS`.
            Err(unsafe { Error::from_raw(code) })
        }
    }

    /// # Safety
    /// `code` must not be `CUDA_SUCCESS`.
    #[cold]
    pub unsafe fn from_raw(code: CUresult) -> Self {
        Error(NonZeroU32::new_unchecked(code as u32))
    }

    pub fn raw(self) -> CUresult {
        // SAFETY: the value was created from a `CUresult`, which is a `u32` enum.
        unsafe { mem::transmute(self.0.get()) }
    }

    /// Symbolic name of the error, such as `CUDA_ERROR_OUT_OF_MEMORY`.
    pub fn name(self) -> Option<&'static str> {
        unsafe {
            let ptr = cuda_call(|v| cuGetErrorName(self.raw(), v)).ok()?;
            str::from_utf8(CStr::from_ptr(ptr).to_bytes()).ok()
        }
    }

    pub fn description(self) -> Option<&'static str> {
        unsafe {
            let ptr = cuda_call(|v| cuGetErrorString(self.raw(), v)).ok()?;
            str::from_utf8(CStr::from_ptr(ptr).to_bytes()).ok()
        }
    }
}

impl StdError for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (errno {}): {}",
            self.name().unwrap_or("<unknown error>"),
            self.0.get(),
            self.description().unwrap_or("<no description>"),
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.debug_tuple("CudaError").field(&name).finish(),
            None => f.debug_tuple("CudaError").field(&self.0).finish(),
        }
    }
}
