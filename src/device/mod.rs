//! Devices, device memory and the command queues that move data and launch kernels.

mod buffer;
#[cfg(feature = "cuda")]
mod compile;
#[cfg(feature = "cuda")]
mod cuda;
mod event;
mod host;
mod program;

pub use buffer::{DeviceBuffer, InUseGuard, RawMemory};
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
pub use event::{Completion, Event, EventSet, ReadEvent};
pub use host::HostBackend;
pub use program::{
    HostFunction, Kernel, KernelArg, KernelArgs, LaunchConfig, NDRange, Program, ProgramSource,
    WorkItem,
};

use parskel_core::{to_bytes, Element};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::prelude::*;
use crate::types::{BackendKind, DeviceConfig, DeviceSelection};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum DeviceKind {
    Host,
    Cuda,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub max_work_group_size: usize,
    pub global_memory: usize,
    pub local_memory: usize,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot allocate {requested} bytes, only {available} of {capacity} bytes available")]
    OutOfMemory {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("buffer {buffer} belongs to device {owner}, not to device {device}")]
    ForeignBuffer {
        buffer: u64,
        owner: DeviceId,
        device: DeviceId,
    },

    #[error("elements {start}..{end} out of range for buffer {buffer} of {len} elements on device {device}")]
    OutOfRange {
        device: DeviceId,
        buffer: u64,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("element size {actual} does not match element size {expected} of buffer {buffer}")]
    ElementSizeMismatch {
        buffer: u64,
        expected: usize,
        actual: usize,
    },

    #[error("program {program:?} is not supported by this device")]
    UnsupportedProgram { program: String },

    #[error("invalid launch configuration {config:?} on device {device}")]
    InvalidLaunch {
        device: DeviceId,
        config: LaunchConfig,
    },

    #[error("kernel {kernel:?} panicked: {message}")]
    KernelPanic {
        kernel: String,
        message: String,
    },

    #[error("command queue of device {0} has shut down")]
    QueueShutDown(DeviceId),

    #[error("no devices available")]
    NoDevices,
}

/// Operations a device implementation provides. All offsets and lengths are in bytes and have
/// been validated by [`Device`] before they reach the backend.
///
/// Commands are executed in the order they are submitted. Each command receives a
/// [`Completion`] that must be completed once the command has finished.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    fn allocate(&self, nbytes: usize) -> Result<Arc<dyn RawMemory>>;

    fn write(&self, buffer: &DeviceBuffer, offset: usize, data: Vec<u8>, completion: Completion);

    fn read(&self, buffer: &DeviceBuffer, offset: usize, len: usize, completion: Completion<Vec<u8>>);

    fn copy(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceBuffer,
        dst_offset: usize,
        len: usize,
        completion: Completion,
    );

    fn launch(
        &self,
        kernel: &Kernel,
        config: LaunchConfig,
        args: Vec<KernelArg>,
        completion: Completion,
    );

    fn build(&self, program: &Program) -> Result<Kernel>;

    /// Block until every previously submitted command has finished.
    fn finish(&self) -> Result;
}

/// A single accelerator together with its command queue.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    backend: Box<dyn DeviceBackend>,
    kernels: Mutex<HashMap<u64, Kernel>>,
}

impl Device {
    pub fn new(id: DeviceId, backend: Box<dyn DeviceBackend>) -> Self {
        Self {
            id,
            backend,
            kernels: default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        self.backend.info()
    }

    pub fn max_work_group_size(&self) -> usize {
        self.info().max_work_group_size
    }

    pub fn create_buffer<T: Element>(&self, len: usize) -> Result<DeviceBuffer> {
        let nbytes = len * T::size_in_bytes();
        let memory = self.backend.allocate(nbytes).with_context(|| {
            format!(
                "failed to create buffer of {} elements ({} bytes) on device {}",
                len, nbytes, self.id
            )
        })?;

        debug!(
            "created buffer of {} elements ({} bytes) on device {}",
            len, nbytes, self.id
        );
        Ok(DeviceBuffer::new(self.id, len, T::size_in_bytes(), memory))
    }

    fn check_buffer(&self, buffer: &DeviceBuffer, start: usize, len: usize) -> Result {
        if buffer.device() != self.id {
            return Err(DeviceError::ForeignBuffer {
                buffer: buffer.id(),
                owner: buffer.device(),
                device: self.id,
            }
            .into());
        }

        if start + len > buffer.size() {
            return Err(DeviceError::OutOfRange {
                device: self.id,
                buffer: buffer.id(),
                start,
                end: start + len,
                len: buffer.size(),
            }
            .into());
        }

        Ok(())
    }

    fn check_elem_size<T: Element>(&self, buffer: &DeviceBuffer) -> Result {
        if buffer.elem_size() != T::size_in_bytes() {
            return Err(DeviceError::ElementSizeMismatch {
                buffer: buffer.id(),
                expected: buffer.elem_size(),
                actual: T::size_in_bytes(),
            }
            .into());
        }

        Ok(())
    }

    /// Write `data` into `buffer` starting at element `offset`.
    pub fn enqueue_write<T: Element>(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        data: &[T],
    ) -> Result<Event> {
        self.check_elem_size::<T>(buffer)?;
        self.check_buffer(buffer, offset, data.len())?;
        trace!(
            "write {} elements to buffer {} at offset {} on device {}",
            data.len(),
            buffer.id(),
            offset,
            self.id
        );

        let (completion, future) = Completion::new(vec![InUseGuard::new(buffer)]);
        self.backend.write(
            buffer,
            offset * buffer.elem_size(),
            to_bytes(data),
            completion,
        );

        Ok(Event::new(self.id, future))
    }

    /// Read `len` elements from `buffer` starting at element `offset`.
    pub fn enqueue_read(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<ReadEvent> {
        self.check_buffer(buffer, offset, len)?;
        trace!(
            "read {} elements from buffer {} at offset {} on device {}",
            len,
            buffer.id(),
            offset,
            self.id
        );

        let elem_size = buffer.elem_size();
        let (completion, future) = Completion::new(vec![InUseGuard::new(buffer)]);
        self.backend
            .read(buffer, offset * elem_size, len * elem_size, completion);

        Ok(ReadEvent::new(self.id, future))
    }

    /// Copy `len` elements between two buffers of this device.
    pub fn enqueue_copy(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceBuffer,
        dst_offset: usize,
        len: usize,
    ) -> Result<Event> {
        self.check_buffer(src, src_offset, len)?;
        self.check_buffer(dst, dst_offset, len)?;
        ensure!(
            src.elem_size() == dst.elem_size(),
            "cannot copy between buffers with element sizes {} and {}",
            src.elem_size(),
            dst.elem_size()
        );
        trace!(
            "copy {} elements from buffer {} to buffer {} on device {}",
            len,
            src.id(),
            dst.id(),
            self.id
        );

        let elem_size = src.elem_size();
        let guards = vec![InUseGuard::new(src), InUseGuard::new(dst)];
        let (completion, future) = Completion::new(guards);
        self.backend.copy(
            src,
            src_offset * elem_size,
            dst,
            dst_offset * elem_size,
            len * elem_size,
            completion,
        );

        Ok(Event::new(self.id, future))
    }

    /// Launch `kernel` over `global` work items in groups of `local` work items. The global
    /// size must be a multiple of the local size in every dimension.
    pub fn enqueue(
        &self,
        kernel: &Kernel,
        global: NDRange,
        local: NDRange,
        offset: NDRange,
        args: KernelArgs,
    ) -> Result<Event> {
        let config = LaunchConfig {
            global,
            local,
            offset,
        };

        if local.volume() == 0
            || global.x % local.x != 0
            || global.y % local.y != 0
            || local.volume() > self.max_work_group_size()
        {
            return Err(DeviceError::InvalidLaunch {
                device: self.id,
                config,
            }
            .into());
        }

        let mut guards = vec![];
        for buffer in args.buffers() {
            self.check_buffer(buffer, 0, buffer.size())
                .with_context(|| format!("invalid argument for kernel {:?}", kernel.name()))?;
            guards.push(InUseGuard::new(buffer));
        }

        trace!(
            "launch kernel {:?} with {:?} on device {}",
            kernel.name(),
            config,
            self.id
        );

        let (completion, future) = Completion::new(guards);
        self.backend
            .launch(kernel, config, args.into_vec(), completion);

        Ok(Event::new(self.id, future))
    }

    /// Returns the kernel for `program`, compiling it on first use.
    pub fn kernel(&self, program: &Program) -> Result<Kernel> {
        let mut kernels = self.kernels.lock();

        if let Some(kernel) = kernels.get(&program.hash()) {
            return Ok(kernel.clone());
        }

        debug!("building program {:?} for device {}", program.name(), self.id);
        let kernel = self
            .backend
            .build(program)
            .with_context(|| format!("failed to build program {:?} for device {}", program.name(), self.id))?;

        kernels.insert(program.hash(), kernel.clone());
        Ok(kernel)
    }

    /// Block until all commands submitted to this device have finished.
    pub fn wait(&self) -> Result {
        self.backend.finish()
    }
}

/// Ordered collection of devices. The position of a device in the list is its [`DeviceId`].
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<Arc<Device>>,
}

impl DeviceList {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        Self { devices }
    }

    /// Discover the devices of the configured backend and keep the selected ones.
    pub fn discover(config: &DeviceConfig) -> Result<Self> {
        let devices = match config.backend {
            BackendKind::Host => {
                let count = match &config.selection {
                    DeviceSelection::All => config.host_device_count,
                    DeviceSelection::First(n) => *n,
                    DeviceSelection::Ids(ids) => ids.iter().map(|&i| i + 1).max().unwrap_or(0),
                };

                (0..count)
                    .map(|_| {
                        let backend = HostBackend::new(
                            config.host_device_memory,
                            config.host_max_work_group_size,
                        )?;
                        Ok(Box::new(backend) as Box<dyn DeviceBackend>)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            BackendKind::Cuda => Self::discover_cuda(config)?,
        };

        let selected = enumerate(devices)
            .filter(|(index, _)| match &config.selection {
                DeviceSelection::All => true,
                DeviceSelection::First(n) => index < n,
                DeviceSelection::Ids(ids) => ids.contains(index),
            })
            .map(|(_, backend)| backend)
            .collect_vec();

        if selected.is_empty() {
            return Err(DeviceError::NoDevices.into());
        }

        let devices = enumerate(selected)
            .map(|(index, backend)| {
                let device = Device::new(DeviceId(index), backend);
                info!(
                    "using device {}: {:?} ({:?}, {} bytes)",
                    index,
                    device.info().name,
                    device.info().kind,
                    device.info().global_memory
                );
                Arc::new(device)
            })
            .collect();

        Ok(Self { devices })
    }

    #[cfg(feature = "cuda")]
    fn discover_cuda(config: &DeviceConfig) -> Result<Vec<Box<dyn DeviceBackend>>> {
        CudaBackend::discover(config)
    }

    #[cfg(not(feature = "cuda"))]
    fn discover_cuda(_config: &DeviceConfig) -> Result<Vec<Box<dyn DeviceBackend>>> {
        bail!("CUDA backend requested but parskel was built without the `cuda` feature")
    }

    pub fn get(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.devices.get(id.0)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    pub fn wait_all(&self) -> Result {
        for device in &self.devices {
            device.wait()?;
        }

        Ok(())
    }
}

impl Deref for DeviceList {
    type Target = [Arc<Device>];

    fn deref(&self) -> &Self::Target {
        &self.devices
    }
}

impl std::ops::Index<DeviceId> for DeviceList {
    type Output = Arc<Device>;

    fn index(&self, id: DeviceId) -> &Self::Output {
        &self.devices[id.0]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Config;

    fn devices(n: usize) -> DeviceList {
        DeviceList::discover(&Config::host(n).device).unwrap()
    }

    #[test]
    fn test_discover() {
        let list = devices(3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.ids(), vec![DeviceId(0), DeviceId(1), DeviceId(2)]);
        assert_eq!(list[DeviceId(2)].info().kind, DeviceKind::Host);

        let mut config = Config::host(4).device;
        config.selection = DeviceSelection::Ids(vec![1, 3]);
        assert_eq!(DeviceList::discover(&config).unwrap().len(), 2);

        let err = DeviceList::discover(&Config::host(0).device).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeviceError>(), Some(DeviceError::NoDevices)));
    }

    #[test]
    fn test_write_read() {
        let list = devices(1);
        let device = &list[DeviceId(0)];
        let buffer = device.create_buffer::<i32>(8).unwrap();

        device
            .enqueue_write(&buffer, 2, &[1, 2, 3])
            .unwrap()
            .wait()
            .unwrap();

        let data: Vec<i32> = device.enqueue_read(&buffer, 0, 8).unwrap().wait_vec().unwrap();
        assert_eq!(data, [0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(!buffer.is_in_use());
    }

    #[test]
    fn test_copy() {
        let list = devices(1);
        let device = &list[DeviceId(0)];
        let a = device.create_buffer::<u16>(4).unwrap();
        let b = device.create_buffer::<u16>(4).unwrap();

        let _ = device.enqueue_write(&a, 0, &[1u16, 2, 3, 4]).unwrap();
        let _ = device.enqueue_copy(&a, 1, &b, 0, 3).unwrap();
        let _ = device.enqueue_copy(&a, 0, &a, 2, 2).unwrap();
        device.wait().unwrap();

        let mut out = [0u16; 4];
        device.enqueue_read(&b, 0, 4).unwrap().wait_into(&mut out).unwrap();
        assert_eq!(out, [2, 3, 4, 0]);
        device.enqueue_read(&a, 0, 4).unwrap().wait_into(&mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2]);
    }

    #[test]
    fn test_invalid_access() {
        let list = devices(2);
        let buffer = list[DeviceId(0)].create_buffer::<f32>(4).unwrap();

        let err = list[DeviceId(1)].enqueue_read(&buffer, 0, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::ForeignBuffer { .. })
        ));

        let err = list[DeviceId(0)].enqueue_write(&buffer, 2, &[1.0f32; 3]).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeviceError>(), Some(DeviceError::OutOfRange { end: 5, .. })));

        let err = list[DeviceId(0)].enqueue_write(&buffer, 0, &[1.0f64]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::ElementSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_kernel_launch() {
        let list = devices(1);
        let device = &list[DeviceId(0)];
        let buffer = device.create_buffer::<u32>(10).unwrap();

        let program = Program::host("iota", |item| {
            let i = item.global_id(0);
            let n: u64 = item.value(1);
            if (i as u64) < n {
                item.store(0, i, (i * i) as u32);
            }
        });

        let kernel = device.kernel(&program).unwrap();
        assert_eq!(
            device.kernel(&program).unwrap().program_hash(),
            kernel.program_hash()
        );

        let args = KernelArgs::new().buffer(&buffer).value(10u64);
        let event = device
            .enqueue(&kernel, NDRange::d1(12), NDRange::d1(4), NDRange::zero(), args)
            .unwrap();
        event.wait().unwrap();

        let data: Vec<u32> = device.enqueue_read(&buffer, 0, 10).unwrap().wait_vec().unwrap();
        assert_eq!(data, (0..10).map(|i| i * i).collect_vec());

        let err = device
            .enqueue(
                &kernel,
                NDRange::d1(10),
                NDRange::d1(4),
                NDRange::zero(),
                KernelArgs::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::InvalidLaunch { .. })
        ));
    }

    #[test]
    fn test_kernel_panic() {
        let list = devices(1);
        let device = &list[DeviceId(0)];
        let buffer = device.create_buffer::<u32>(2).unwrap();

        let program = Program::host("oob", |item| {
            let i = item.global_id(0);
            item.store(0, i, 1u32);
        });

        let kernel = device.kernel(&program).unwrap();
        let err = device
            .enqueue(
                &kernel,
                NDRange::d1(4),
                NDRange::d1(4),
                NDRange::zero(),
                KernelArgs::new().buffer(&buffer),
            )
            .unwrap()
            .wait()
            .unwrap_err();

        assert!(format!("{:?}", err).contains("panicked"));
        assert!(!buffer.is_in_use());

        // The queue keeps working after a failed kernel.
        device.enqueue_write(&buffer, 0, &[5u32, 6]).unwrap().wait().unwrap();
    }

    #[test]
    fn test_text_program_unsupported() {
        let list = devices(1);
        let program = Program::text("__global__ void f() {}", "f");
        assert!(list[DeviceId(0)].kernel(&program).is_err());
    }
}
