//! CUDA streams.

use crate::{cuda_call, cuda_check, Result};
use cuda_driver_sys::*;
use std::fmt;
use std::os::raw::c_uint;

/// Queue of asynchronous work on a device. Work submitted to the same stream executes in
/// submission order.
#[derive(PartialEq, Eq)]
#[repr(transparent)]
pub struct Stream(CUstream);

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    /// Create a stream in the current context that does not synchronize with the default stream.
    pub fn new() -> Result<Self> {
        Self::with_flags(StreamFlags::NON_BLOCKING)
    }

    pub fn with_flags(flags: StreamFlags) -> Result<Self> {
        unsafe { cuda_call(|v| cuStreamCreate(v, flags.bits)).map(Self) }
    }

    /// Block until all work enqueued onto this stream has completed.
    pub fn synchronize(&self) -> Result {
        unsafe { cuda_check(cuStreamSynchronize(self.0)) }
    }

    #[inline(always)]
    pub fn raw(&self) -> CUstream {
        self.0
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CudaStream").field(&self.0).finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe {
            cuStreamDestroy_v2(self.0);
        }
    }
}

bitflags::bitflags! {
    /// The `CU_STREAM_*` flags.
    pub struct StreamFlags: c_uint {
        const DEFAULT = CUstream_flags_enum::CU_STREAM_DEFAULT as c_uint;
        const NON_BLOCKING = CUstream_flags_enum::CU_STREAM_NON_BLOCKING as c_uint;
    }
}
