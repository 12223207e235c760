//! Device memory and copies between host and device.
use crate::{cuda_call, cuda_check, Error, Result, Stream};
use cuda_driver_sys::*;
use std::ffi::c_void;
use std::fmt;

/// Untyped buffer in device memory. Allocated with `cuMemAlloc` and freed with `cuMemFree` when
/// dropped, which requires the owning context to be alive.
pub struct DeviceMem {
    ptr: CUdeviceptr,
    size_in_bytes: usize,
}

unsafe impl Send for DeviceMem {}
unsafe impl Sync for DeviceMem {}

impl fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CudaDeviceMem({:p}, {})",
            self.ptr as *const (), self.size_in_bytes
        )
    }
}

impl DeviceMem {
    /// Allocate `size_in_bytes` bytes of uninitialized memory in the current context.
    ///
    /// CUDA refuses zero-sized allocations, so empty buffers are rounded up to one byte.
    pub fn empty(size_in_bytes: usize) -> Result<Self> {
        let ptr = unsafe { cuda_call(|p| cuMemAlloc_v2(p, size_in_bytes.max(1))) }?;
        Ok(Self { ptr, size_in_bytes })
    }

    #[inline(always)]
    pub fn raw(&self) -> CUdeviceptr {
        self.ptr
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    fn check_range(&self, offset: usize, len: usize) -> Result {
        match offset.checked_add(len) {
            Some(end) if end <= self.size_in_bytes => Ok(()),
            _ => Err(unsafe { Error::from_raw(CUresult::CUDA_ERROR_INVALID_VALUE) }),
        }
    }

    /// Enqueue a copy from host memory to this buffer.
    ///
    /// # Safety
    /// `src` must stay valid until the stream has been synchronized.
    pub unsafe fn copy_from_host_async(
        &self,
        offset: usize,
        src: &[u8],
        stream: &Stream,
    ) -> Result {
        self.check_range(offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        cuda_check(cuMemcpyHtoDAsync_v2(
            self.ptr + offset as CUdeviceptr,
            src.as_ptr() as *const c_void,
            src.len(),
            stream.raw(),
        ))
    }

    /// Enqueue a copy from this buffer to host memory.
    ///
    /// # Safety
    /// `dst` must stay valid and must not be accessed until the stream has been synchronized.
    pub unsafe fn copy_to_host_async(
        &self,
        offset: usize,
        dst: &mut [u8],
        stream: &Stream,
    ) -> Result {
        self.check_range(offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }

        cuda_check(cuMemcpyDtoHAsync_v2(
            dst.as_mut_ptr() as *mut c_void,
            self.ptr + offset as CUdeviceptr,
            dst.len(),
            stream.raw(),
        ))
    }

    /// Enqueue a copy of `len` bytes between two buffers of the same context.
    pub fn copy_to_device_async(
        &self,
        src_offset: usize,
        dst: &DeviceMem,
        dst_offset: usize,
        len: usize,
        stream: &Stream,
    ) -> Result {
        self.check_range(src_offset, len)?;
        dst.check_range(dst_offset, len)?;
        if len == 0 {
            return Ok(());
        }

        unsafe {
            cuda_check(cuMemcpyDtoDAsync_v2(
                dst.ptr + dst_offset as CUdeviceptr,
                self.ptr + src_offset as CUdeviceptr,
                len,
                stream.raw(),
            ))
        }
    }
}

impl Drop for DeviceMem {
    fn drop(&mut self) {
        unsafe {
            cuMemFree_v2(self.ptr);
        }
    }
}
