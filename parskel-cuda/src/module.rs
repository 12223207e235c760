//! Loading compiled modules and launching their kernels.

use crate::{cuda_call, cuda_check, Result, Stream};
use cuda_driver_sys::*;
use std::ffi::{c_void, CStr};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;

/// Module loaded into the current context. Unloaded when dropped.
#[repr(transparent)]
pub struct Module(CUmodule);

unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CudaModule").field(&self.0).finish()
    }
}

impl Module {
    /// Load a module from a cubin, PTX or fatbin image.
    ///
    /// # Safety
    /// `image` must point to a valid image. PTX images must be null-terminated.
    pub unsafe fn load_image(image: *const c_void) -> Result<Self> {
        cuda_call(|m| cuModuleLoadData(m, image)).map(Self)
    }

    pub fn function(&self, name: &CStr) -> Result<Function<'_>> {
        unsafe {
            let fun = cuda_call(|f| cuModuleGetFunction(f, self.0, name.as_ptr()))?;
            Ok(Function {
                fun,
                phantom: PhantomData,
            })
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        unsafe {
            cuModuleUnload(self.0);
        }
    }
}

/// Kernel inside a [`Module`].
#[repr(transparent)]
pub struct Function<'a> {
    fun: CUfunction,
    phantom: PhantomData<&'a Module>,
}

impl fmt::Debug for Function<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CudaFunction").field(&self.fun).finish()
    }
}

impl Function<'_> {
    /// Enqueue a launch of this kernel onto `stream`.
    ///
    /// # Safety
    /// `arguments` must contain one pointer per kernel parameter, each pointing to a value of the
    /// parameter's type. The pointed-to values only need to live until this call returns.
    pub unsafe fn launch_async(
        &self,
        stream: &Stream,
        grid: Dim3,
        block: Dim3,
        smem_size: u32,
        arguments: &[*const c_void],
    ) -> Result {
        let mut arguments = arguments.to_vec();
        arguments.push(ptr::null());

        cuda_check(cuLaunchKernel(
            self.fun,
            grid.0,
            grid.1,
            grid.2,
            block.0,
            block.1,
            block.2,
            smem_size,
            stream.raw(),
            arguments.as_mut_ptr() as *mut *mut c_void,
            ptr::null_mut(),
        ))
    }
}

/// Grid or block size in three dimensions.
#[repr(C)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Dim3(pub u32, pub u32, pub u32);

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3(x, y, z)
    }
}

impl From<[u32; 3]> for Dim3 {
    fn from(v: [u32; 3]) -> Self {
        Dim3::new(v[0], v[1], v[2])
    }
}
