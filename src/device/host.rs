use crossbeam::channel::{self, Receiver, Sender};
use parskel_core::try_block;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::program::{ArgSlot, HostFunction};
use super::{
    Completion, DeviceBackend, DeviceBuffer, DeviceError, DeviceInfo, DeviceKind,
    Kernel, KernelArg, LaunchConfig, Program, ProgramSource, RawMemory, WorkItem,
};
use crate::prelude::*;

#[derive(Debug)]
struct HostMemory {
    data: Mutex<Box<[u8]>>,
    len: usize,
    allocated: Arc<AtomicUsize>,
}

impl RawMemory for HostMemory {
    fn size_in_bytes(&self) -> usize {
        self.len
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.len, Ordering::SeqCst);
    }
}

fn host_memory(buffer: &DeviceBuffer) -> Result<&HostMemory> {
    buffer
        .memory()
        .as_any()
        .downcast_ref::<HostMemory>()
        .ok_or_else(|| anyhow!("buffer {} is not host memory", buffer.id()))
}

struct HostKernel(Arc<HostFunction>);

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

/// Device emulated on the host. Commands are executed in submission order by one thread per
/// device and kernels run their work items sequentially.
#[derive(Debug)]
pub struct HostBackend {
    info: DeviceInfo,
    capacity: Option<usize>,
    allocated: Arc<AtomicUsize>,
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl HostBackend {
    pub fn new(capacity: Option<usize>, max_work_group_size: usize) -> Result<Self> {
        static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);
        let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);

        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("host-device-{}", index))
            .spawn(move || main_loop(receiver))
            .context("failed to spawn host device thread")?;

        Ok(Self {
            info: DeviceInfo {
                name: format!("host device {}", index),
                kind: DeviceKind::Host,
                max_work_group_size,
                global_memory: capacity.unwrap_or(usize::MAX),
                local_memory: 64 * 1024,
            },
            capacity,
            allocated: default(),
            sender,
            handle: Some(handle),
        })
    }

    fn submit(&self, command: Command) {
        // If the thread is gone, the command is dropped together with its completion, which
        // resolves the event with a shutdown error.
        let _ = self.sender.send(command);
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread of {} panicked", self.info.name);
            }
        }
    }
}

impl DeviceBackend for HostBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, nbytes: usize) -> Result<Arc<dyn RawMemory>> {
        let before = self.allocated.fetch_add(nbytes, Ordering::SeqCst);

        if let Some(capacity) = self.capacity {
            if before + nbytes > capacity {
                self.allocated.fetch_sub(nbytes, Ordering::SeqCst);

                return Err(DeviceError::OutOfMemory {
                    requested: nbytes,
                    available: capacity.saturating_sub(before),
                    capacity,
                }
                .into());
            }
        }

        Ok(Arc::new(HostMemory {
            data: Mutex::new(vec![0; nbytes].into_boxed_slice()),
            len: nbytes,
            allocated: Arc::clone(&self.allocated),
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
        match program.source() {
            ProgramSource::Host(fun) => Ok(Kernel::new(
                program,
                Arc::new(HostKernel(Arc::clone(fun))),
            )),
            ProgramSource::Text(_) => Err(DeviceError::UnsupportedProgram {
                program: program.name().to_string(),
            }
            .into()),
        }
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

fn main_loop(receiver: Receiver<Command>) {
    use Command::*;

    while let Ok(command) = receiver.recv() {
        match command {
            Write {
                buffer,
                offset,
                data,
                completion,
            } => {
                let result: Result = try_block! {
                    let mut memory = host_memory(&buffer)?.data.lock();
                    memory[offset..offset + data.len()].copy_from_slice(&data);
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
                    let memory = host_memory(&buffer)?.data.lock();
                    Ok(memory[offset..offset + len].to_vec())
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
                let result = execute_copy(&src, src_offset, &dst, dst_offset, len);
                completion.complete(result);
            }
            Launch {
                kernel,
                config,
                args,
                completion,
            } => {
                let result = execute_kernel(&kernel, config, &args);
                completion.complete(result);
            }
            Barrier(completion) => completion.complete_ok(()),
            Shutdown => break,
        }
    }
}

fn execute_copy(
    src: &DeviceBuffer,
    src_offset: usize,
    dst: &DeviceBuffer,
    dst_offset: usize,
    len: usize,
) -> Result {
    if src.ptr_eq(dst) {
        let mut memory = host_memory(src)?.data.lock();
        memory.copy_within(src_offset..src_offset + len, dst_offset);
    } else {
        let input = host_memory(src)?.data.lock();
        let mut output = host_memory(dst)?.data.lock();
        output[dst_offset..dst_offset + len].copy_from_slice(&input[src_offset..src_offset + len]);
    }

    Ok(())
}

fn execute_kernel(kernel: &Kernel, config: LaunchConfig, args: &[KernelArg]) -> Result {
    let fun = match kernel.downcast::<HostKernel>() {
        Some(HostKernel(fun)) => fun,
        None => bail!("kernel {:?} was not built for a host device", kernel.name()),
    };

    // Each distinct buffer is locked exactly once, even if it is passed multiple times.
    let mut owners: Vec<&DeviceBuffer> = vec![];
    let mut slots = vec![];
    let mut locals = vec![];

    for arg in args {
        slots.push(match arg {
            KernelArg::Buffer(buffer) => {
                let index = match owners.iter().position(|b| b.id() == buffer.id()) {
                    Some(index) => index,
                    None => {
                        owners.push(buffer);
                        owners.len() - 1
                    }
                };

                ArgSlot::Buffer(index)
            }
            KernelArg::Value(bytes) => ArgSlot::Value(bytes.clone()),
            KernelArg::Local(nbytes) => {
                locals.push(vec![0u8; *nbytes]);
                ArgSlot::Local(locals.len() - 1)
            }
        });
    }

    let mut guards = owners
        .iter()
        .map(|buffer| Ok(host_memory(buffer)?.data.lock()))
        .collect::<Result<Vec<_>>>()?;

    let LaunchConfig {
        global,
        local,
        offset,
    } = config;

    let mut item = WorkItem {
        global_id: [0; 2],
        global_size: [global.x, global.y],
        local_id: [0; 2],
        local_size: [local.x, local.y],
        offset: [offset.x, offset.y],
        args: slots,
        buffers: guards.iter_mut().map(|g| &mut g[..]).collect(),
        locals,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        for group_y in 0..global.y / local.y {
            for group_x in 0..global.x / local.x {
                for local_y in 0..local.y {
                    for local_x in 0..local.x {
                        item.local_id = [local_x, local_y];
                        item.global_id = [group_x * local.x + local_x, group_y * local.y + local_y];
                        (fun)(&mut item);
                    }
                }
            }
        }
    }));

    if let Err(payload) = result {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        return Err(DeviceError::KernelPanic {
            kernel: kernel.name().to_string(),
            message,
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{Device, DeviceId, KernelArgs, NDRange};

    #[test]
    fn test_capacity() {
        let device = Device::new(DeviceId(0), Box::new(HostBackend::new(Some(100), 64).unwrap()));
        let a = device.create_buffer::<u8>(60).unwrap();

        let err = device.create_buffer::<u8>(50).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::OutOfMemory { requested: 50, .. })
        ));

        drop(a);
        device.create_buffer::<u8>(100).unwrap();
    }

    #[test]
    fn test_aliased_arguments() {
        let device = Device::new(DeviceId(0), Box::new(HostBackend::new(None, 64).unwrap()));
        let buffer = device.create_buffer::<i64>(4).unwrap();
        let _ = device.enqueue_write(&buffer, 0, &[1i64, 2, 3, 4]).unwrap();

        let program = Program::host("shift", |item| {
            let i = item.global_id(0);
            if i > 0 {
                let v: i64 = item.load(0, i - 1);
                item.store(1, i, v * 10);
            }
        });

        let kernel = device.kernel(&program).unwrap();
        let args = KernelArgs::new().buffer(&buffer).buffer(&buffer);
        device
            .enqueue(
                &kernel,
                NDRange::d1(4),
                NDRange::d1(1),
                NDRange::zero(),
                args,
            )
            .unwrap()
            .wait()
            .unwrap();

        // Work items run in order, so each item sees the value written by its predecessor.
        let data: Vec<i64> = device.enqueue_read(&buffer, 0, 4).unwrap().wait_vec().unwrap();
        assert_eq!(data, [1, 10, 100, 1000]);
    }
}
