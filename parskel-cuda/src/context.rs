//! Primary contexts of CUDA devices.

use crate::{cuda_call, cuda_check, Device, Error, Result};
use cuda_driver_sys::*;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Retain the primary context of the given device, incrementing its usage count.
///
/// Every call must be matched by a call to [`release_device_context`].
pub fn retain_device_context(device: Device) -> Result<ContextHandle> {
    unsafe {
        let raw = cuda_call(|c| cuDevicePrimaryCtxRetain(c, device.raw()))?;
        ContextHandle::from_raw(raw).ok_or_else(|| Error::from_raw(CUresult::CUDA_ERROR_INVALID_CONTEXT))
    }
}

/// Release the primary context of the given device. The context is destroyed once its usage
/// count drops to zero.
///
/// # Safety
/// Every resource (streams, memory, modules) created in the context becomes invalid once the
/// context is destroyed.
pub unsafe fn release_device_context(device: Device) -> Result {
    cuda_check(cuDevicePrimaryCtxRelease(device.raw()))
}

/// Handle to a CUDA context. Does not own the context.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct ContextHandle(NonNull<()>);

// The driver API is thread-safe.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CudaContextHandle").field(&self.0).finish()
    }
}

impl ContextHandle {
    /// Call `fun` while this context is the current context of the calling thread.
    pub fn try_with<F, T, E>(self, fun: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<Error>,
    {
        let guard = self.activate()?;
        let out = (fun)();
        drop(guard);

        out
    }

    /// Push this context onto the context stack of the calling thread. The context is popped
    /// again once the returned guard is dropped.
    pub fn activate(&self) -> Result<ContextGuard<'_>> {
        unsafe { cuda_check(cuCtxPushCurrent_v2(self.raw())) }?;
        Ok(ContextGuard(PhantomData))
    }

    /// Block until all work submitted to this context has completed.
    pub fn synchronize(self) -> Result {
        self.try_with(|| unsafe { cuda_check(cuCtxSynchronize()) })
    }

    /// Free and total memory in bytes of the device associated with this context.
    pub fn memory_free_and_total(self) -> Result<(usize, usize)> {
        self.try_with(|| {
            let (mut free, mut total) = (0, 0);
            cuda_check(unsafe { cuMemGetInfo_v2(&mut free, &mut total) })?;
            Ok((free, total))
        })
    }

    #[inline(always)]
    pub fn raw(self) -> CUcontext {
        self.0.as_ptr() as CUcontext
    }

    /// Returns `None` if `c` is null.
    ///
    /// # Safety
    /// `c` must be a valid `CUcontext`.
    #[inline(always)]
    pub unsafe fn from_raw(c: CUcontext) -> Option<Self> {
        NonNull::new(c as *mut ()).map(Self)
    }
}

/// Pops the current context when dropped. See [`ContextHandle::activate`].
#[derive(Debug)]
// The raw pointer makes the guard `!Send`: the context stack is thread-local.
pub struct ContextGuard<'a>(PhantomData<(&'a ContextHandle, *mut ())>);

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut popped = std::ptr::null_mut();
        unsafe {
            cuCtxPopCurrent_v2(&mut popped);
        }
    }
}
