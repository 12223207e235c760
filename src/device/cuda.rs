use crossbeam::channel::{self, Receiver, Sender};
use parskel_core::try_block;
use parskel_cuda::{ContextHandle, DeviceAttribute, DeviceMem, Dim3, Module, Stream};
use std::any::Any;
use std::ffi::{c_void, CString};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::compile::KernelCompiler;
use super::{
    Completion, DeviceBackend, DeviceBuffer, DeviceError, DeviceInfo, DeviceKind, Kernel,
    KernelArg, LaunchConfig, Program, ProgramSource, RawMemory,
};
use crate::prelude::*;
use crate::types::DeviceConfig;

/// Retained primary context of one GPU. Released once the backend, every buffer and every kernel
/// of the device have been dropped.
#[derive(Debug)]
struct PrimaryContext {
    device: parskel_cuda::Device,
    handle: ContextHandle,
}

impl PrimaryContext {
    fn retain(device: parskel_cuda::Device) -> Result<Arc<Self>> {
        let handle = parskel_cuda::retain_device_context(device)?;
        Ok(Arc::new(Self { device, handle }))
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        if let Err(e) = unsafe { parskel_cuda::release_device_context(self.device) } {
            warn!("failed to release context of {:?}: {}", self.device, e);
        }
    }
}

#[derive(Debug)]
struct CudaMemory {
    mem: Option<DeviceMem>,
    context: Arc<PrimaryContext>,
}

impl CudaMemory {
    fn mem(&self) -> Result<&DeviceMem> {
        self.mem
            .as_ref()
            .ok_or_else(|| anyhow!("device memory was already released"))
    }
}

impl RawMemory for CudaMemory {
    fn size_in_bytes(&self) -> usize {
        self.mem.as_ref().map_or(0, |m| m.size_in_bytes())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CudaMemory {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            // cuMemFree needs the owning context to be current.
            let _ = self.context.handle.try_with(|| {
                drop(mem);
                Ok::<_, parskel_cuda::Error>(())
            });
        }
    }
}

fn cuda_memory(buffer: &DeviceBuffer) -> Result<&DeviceMem> {
    buffer
        .memory()
        .as_any()
        .downcast_ref::<CudaMemory>()
        .ok_or_else(|| anyhow!("buffer {} is not CUDA memory", buffer.id()))?
        .mem()
}

struct CudaKernel {
    module: Option<Module>,
    entry: CString,
    context: Arc<PrimaryContext>,
}

impl Drop for CudaKernel {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            let _ = self.context.handle.try_with(|| {
                drop(module);
                Ok::<_, parskel_cuda::Error>(())
            });
        }
    }
}

enum Command {
    Write {
        buffer: DeviceBuffer,
        offset: usize,
        data: Vec<u8>,
        completion: Completion,
    },
    Read {
        buffer: DeviceBuffer,
        offset: usize,
        len: usize,
        completion: Completion<Vec<u8>>,
    },
    Copy {
        src: DeviceBuffer,
        src_offset: usize,
        dst: DeviceBuffer,
        dst_offset: usize,
        len: usize,
        completion: Completion,
    },
    Launch {
        kernel: Kernel,
        config: LaunchConfig,
        args: Vec<KernelArg>,
        completion: Completion,
    },
    Barrier(Completion),
    Shutdown,
}

/// NVIDIA GPU driven through the CUDA driver API.
///
/// Commands are submitted to a dedicated thread per GPU which owns one stream. Every command
/// synchronizes the stream before its completion fires, so host data handed to the driver
/// outlives the transfer.
///
/// Only [`ProgramSource::Text`] programs can be built. The source is compiled by nvcc and the
/// kernel receives its arguments in order: buffers as device pointers and values by value.
/// [`KernelArg::Local`] arguments are not passed; their sizes are summed into the dynamic shared
/// memory of the launch.
#[derive(Debug)]
pub struct CudaBackend {
    info: DeviceInfo,
    context: Arc<PrimaryContext>,
    compiler: KernelCompiler,
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl CudaBackend {
    /// Initialize CUDA and create a backend for every GPU in the system.
    pub fn discover(config: &DeviceConfig) -> Result<Vec<Box<dyn DeviceBackend>>> {
        parskel_cuda::init().context("failed to initialize CUDA")?;

        let (major, minor) = parskel_cuda::version()?;
        debug!("CUDA driver version {}.{}", major, minor);

        parskel_cuda::Device::all()?
            .into_iter()
            .map(|device| {
                let backend = Self::new(device, config)
                    .with_context(|| format!("failed to initialize {:?}", device))?;
                Ok(Box::new(backend) as Box<dyn DeviceBackend>)
            })
            .collect()
    }

    fn new(device: parskel_cuda::Device, config: &DeviceConfig) -> Result<Self> {
        let context = PrimaryContext::retain(device)?;
        let info = DeviceInfo {
            name: device.name()?,
            kind: DeviceKind::Cuda,
            max_work_group_size: device.attribute(DeviceAttribute::MAX_THREADS_PER_BLOCK)? as usize,
            global_memory: device.total_memory()?,
            local_memory: device.attribute(DeviceAttribute::MAX_SHARED_MEMORY_PER_BLOCK)? as usize,
        };

        let (sender, receiver) = channel::unbounded();
        let thread_context = Arc::clone(&context);
        let handle = thread::Builder::new()
            .name(format!("cuda-device-{}", device.ordinal()))
            .spawn(move || {
                if let Err(e) = main_loop(&thread_context, receiver) {
                    error!("thread of {:?} stopped: {:?}", thread_context.device, e);
                }
            })
            .context("failed to spawn CUDA device thread")?;

        Ok(Self {
            info,
            context,
            compiler: KernelCompiler::new(config),
            sender,
            handle: Some(handle),
        })
    }

    fn submit(&self, command: Command) {
        let _ = self.sender.send(command);
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread of {} panicked", self.info.name);
            }
        }
    }
}

impl DeviceBackend for CudaBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, nbytes: usize) -> Result<Arc<dyn RawMemory>> {
        let (free, total) = self.context.handle.memory_free_and_total()?;
        if nbytes > free {
            return Err(DeviceError::OutOfMemory {
                requested: nbytes,
                available: free,
                capacity: total,
            }
            .into());
        }

        let mem = self.context.handle.try_with(|| DeviceMem::empty(nbytes))?;

        Ok(Arc::new(CudaMemory {
            mem: Some(mem),
            context: Arc::clone(&self.context),
        }))
    }

    fn write(&self, buffer: &DeviceBuffer, offset: usize, data: Vec<u8>, completion: Completion) {
        self.submit(Command::Write {
            buffer: buffer.clone(),
            offset,
            data,
            completion,
        });
    }

    fn read(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        len: usize,
        completion: Completion<Vec<u8>>,
    ) {
        self.submit(Command::Read {
            buffer: buffer.clone(),
            offset,
            len,
            completion,
        });
    }

    fn copy(
        &self,
        src: &DeviceBuffer,
        src_offset: usize,
        dst: &DeviceBuffer,
        dst_offset: usize,
        len: usize,
        completion: Completion,
    ) {
        self.submit(Command::Copy {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            len,
            completion,
        });
    }

    fn launch(
        &self,
        kernel: &Kernel,
        config: LaunchConfig,
        args: Vec<KernelArg>,
        completion: Completion,
    ) {
        self.submit(Command::Launch {
            kernel: kernel.clone(),
            config,
            args,
            completion,
        });
    }

    fn build(&self, program: &Program) -> Result<Kernel> {
        let source = match program.source() {
            ProgramSource::Text(source) => source,
            ProgramSource::Host(_) => {
                return Err(DeviceError::UnsupportedProgram {
                    program: program.name().to_string(),
                }
                .into())
            }
        };

        let capability = self.context.device.compute_capability()?;
        let image = self.compiler.compile(source, capability)?;
        let module = self
            .context
            .handle
            .try_with(|| unsafe { Module::load_image(image.as_ptr() as *const c_void) })?;

        let entry = CString::new(program.entry())
            .with_context(|| format!("invalid kernel name {:?}", program.entry()))?;

        // Fail at build time if the entry point does not exist.
        module.function(&entry)?;

        Ok(Kernel::new(
            program,
            Arc::new(CudaKernel {
                module: Some(module),
                entry,
                context: Arc::clone(&self.context),
            }),
        ))
    }

    fn finish(&self) -> Result {
        let (completion, future) = Completion::new(vec![]);
        self.submit(Command::Barrier(completion));

        match future.wait() {
            Ok(result) => result,
            Err(_) => bail!("{} has shut down", self.info.name),
        }
    }
}

fn main_loop(context: &PrimaryContext, receiver: Receiver<Command>) -> Result {
    use Command::*;

    let _guard = context.handle.activate()?;
    let stream = Stream::new()?;

    while let Ok(command) = receiver.recv() {
        match command {
            Write {
                buffer,
                offset,
                data,
                completion,
            } => {
                let result: Result = try_block! {
                    unsafe { cuda_memory(&buffer)?.copy_from_host_async(offset, &data, &stream)? };
                    stream.synchronize()?;
                    Ok(())
                };

                completion.complete(result);
            }
            Read {
                buffer,
                offset,
                len,
                completion,
            } => {
                let result: Result<Vec<u8>> = try_block! {
                    let mut output = vec![0; len];
                    unsafe { cuda_memory(&buffer)?.copy_to_host_async(offset, &mut output, &stream)? };
                    stream.synchronize()?;
                    Ok(output)
                };

                completion.complete(result);
            }
            Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                len,
                completion,
            } => {
                let result: Result = try_block! {
                    cuda_memory(&src)?.copy_to_device_async(
                        src_offset,
                        cuda_memory(&dst)?,
                        dst_offset,
                        len,
                        &stream,
                    )?;
                    stream.synchronize()?;
                    Ok(())
                };

                completion.complete(result);
            }
            Launch {
                kernel,
                config,
                args,
                completion,
            } => {
                let result = execute_kernel(&stream, &kernel, config, &args);
                completion.complete(result);
            }
            Barrier(completion) => {
                completion.complete(stream.synchronize().map_err(Error::from));
            }
            Shutdown => break,
        }
    }

    Ok(())
}

fn execute_kernel(
    stream: &Stream,
    kernel: &Kernel,
    config: LaunchConfig,
    args: &[KernelArg],
) -> Result {
    let inner = match kernel.downcast::<CudaKernel>() {
        Some(inner) => inner,
        None => bail!("kernel {:?} was not built for a CUDA device", kernel.name()),
    };

    let module = inner
        .module
        .as_ref()
        .ok_or_else(|| anyhow!("module of kernel {:?} was unloaded", kernel.name()))?;
    let function = module.function(&inner.entry)?;

    let LaunchConfig {
        global,
        local,
        offset,
    } = config;

    ensure!(
        offset.x == 0 && offset.y == 0,
        "CUDA kernels do not support a global offset ({:?})",
        offset
    );

    // The driver copies each parameter out of these buffers during the launch call.
    let mut params: Vec<Vec<u8>> = vec![];
    let mut shared_memory = 0;

    for arg in args {
        match arg {
            KernelArg::Buffer(buffer) => {
                params.push(cuda_memory(buffer)?.raw().to_ne_bytes().to_vec());
            }
            KernelArg::Value(bytes) => params.push(bytes.to_vec()),
            KernelArg::Local(nbytes) => shared_memory += nbytes,
        }
    }

    let pointers = params
        .iter()
        .map(|p| p.as_ptr() as *const c_void)
        .collect_vec();

    let grid = Dim3::new((global.x / local.x) as u32, (global.y / local.y) as u32, 1);
    let block = Dim3::new(local.x as u32, local.y as u32, 1);

    unsafe {
        function.launch_async(stream, grid, block, shared_memory as u32, &pointers)?;
    }

    stream.synchronize()?;
    Ok(())
}
