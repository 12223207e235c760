//! CUDA devices.
use crate::{cuda_call, cuda_check, Error, Result};
use cuda_driver_sys::*;
use std::convert::TryInto;
use std::ffi::CStr;
use std::{fmt, mem};

/// Handle to a CUDA-capable device. Wraps a `CUdevice` which is known to be valid.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Device(CUdevice);

// CUdevice is a plain integer.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Number of CUDA-capable devices in the system.
    pub fn count() -> Result<usize> {
        let n = unsafe { cuda_call(|ptr| cuDeviceGetCount(ptr)) }?;
        Ok(n as usize)
    }

    /// All CUDA-capable devices in the system, ordered by ordinal.
    pub fn all() -> Result<Vec<Self>> {
        (0..Self::count()?).map(Self::nth).collect()
    }

    pub fn nth(ordinal: usize) -> Result<Self> {
        unsafe {
            let i = ordinal
                .try_into()
                .map_err(|_| Error::from_raw(CUresult::CUDA_ERROR_INVALID_VALUE))?;
            cuda_call(|ptr| cuDeviceGet(ptr, i)).map(Self)
        }
    }

    #[inline(always)]
    pub fn raw(self) -> CUdevice {
        self.0
    }

    pub fn ordinal(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> Result<String> {
        let mut buffer = [0; 256];
        unsafe {
            cuda_check(cuDeviceGetName(
                buffer.as_mut_ptr(),
                buffer.len() as i32,
                self.0,
            ))?;

            let name = CStr::from_ptr(buffer.as_ptr());
            Ok(name.to_string_lossy().into_owned())
        }
    }

    /// Compute capability as `(major, minor)`, for example `(7, 5)` for Turing.
    pub fn compute_capability(self) -> Result<(i32, i32)> {
        Ok((
            self.attribute(DeviceAttribute::COMPUTE_CAPABILITY_MAJOR)?,
            self.attribute(DeviceAttribute::COMPUTE_CAPABILITY_MINOR)?,
        ))
    }

    pub fn attribute(self, attrib: DeviceAttribute) -> Result<i32> {
        unsafe {
            let attrib = mem::transmute::<DeviceAttribute, CUdevice_attribute>(attrib);
            cuda_call(|v| cuDeviceGetAttribute(v, attrib, self.0))
        }
    }

    /// Total memory capacity of this device in bytes.
    pub fn total_memory(self) -> Result<usize> {
        unsafe { cuda_call(|v| cuDeviceTotalMem_v2(v, self.0)) }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CudaDevice").field(&self.0).finish()
    }
}

use CUdevice_attribute_enum::*;

/// The subset of `CUdevice_attribute` which is queried by the runtime.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum DeviceAttribute {
    MAX_THREADS_PER_BLOCK = CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK as u32,
    MAX_SHARED_MEMORY_PER_BLOCK = CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK as u32,
    MULTIPROCESSOR_COUNT = CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT as u32,
    COMPUTE_CAPABILITY_MAJOR = CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR as u32,
    COMPUTE_CAPABILITY_MINOR = CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR as u32,
    UNIFIED_ADDRESSING = CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING as u32,
}
