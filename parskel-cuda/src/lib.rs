//! Thin wrappers around the parts of the CUDA driver API used by the CUDA backend of parskel.
//!
//! Most types wrap a single CUDA handle: [`Stream`] is a newtype around `CUstream`,
//! [`Stream::new`] calls `cuStreamCreate` and dropping it calls `cuStreamDestroy`. Nearly every
//! function returns a [`Result`] carrying the `CUresult` status code on failure.
#![deny(
    missing_debug_implementations,
    bare_trait_objects,
    unused_import_braces,
    unused_qualifications
)]
use cuda_driver_sys::*;

pub mod context;
pub mod device;
pub mod error;
pub mod mem;
pub mod module;
pub mod stream;

pub use context::*;
pub use device::*;
pub use error::*;
pub use mem::*;
pub use module::*;
pub use stream::*;

/// Initialize the CUDA driver. Must be called before any other function of this crate.
pub fn init() -> Result {
    unsafe { cuda_check(cuInit(0)) }
}

/// Version of the CUDA driver as `(major, minor)`.
pub fn version() -> Result<(u32, u32)> {
    let value = unsafe { cuda_call(|v| cuDriverGetVersion(v)) }? as u32;

    // The driver reports 1000 * major + 10 * minor.
    Ok((value / 1000, (value % 1000) / 10))
}
