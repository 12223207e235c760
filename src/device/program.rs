use parskel_core::{as_bytes, load_element, store_element, Element};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::DeviceBuffer;
use crate::prelude::*;

/// Work size in up to two dimensions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct NDRange {
    pub x: usize,
    pub y: usize,
}

impl NDRange {
    pub const fn d1(x: usize) -> Self {
        Self { x, y: 1 }
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    pub const fn zero() -> Self {
        Self { x: 0, y: 0 }
    }

    pub fn volume(&self) -> usize {
        self.x * self.y
    }

    pub fn get(&self, dim: usize) -> usize {
        match dim {
            0 => self.x,
            1 => self.y,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LaunchConfig {
    pub global: NDRange,
    pub local: NDRange,
    pub offset: NDRange,
}

#[derive(Clone, Debug)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    Value(SmallVec<[u8; 16]>),

    /// Scratch memory shared by the work items of a work group, in bytes.
    Local(usize),
}

/// Builder for the argument list of a kernel launch.
#[derive(Clone, Debug, Default)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        default()
    }

    pub fn buffer(mut self, buffer: &DeviceBuffer) -> Self {
        self.args.push(KernelArg::Buffer(buffer.clone()));
        self
    }

    pub fn value<T: Element>(mut self, value: T) -> Self {
        self.args
            .push(KernelArg::Value(SmallVec::from_slice(as_bytes(&[value]))));
        self
    }

    pub fn local(mut self, nbytes: usize) -> Self {
        self.args.push(KernelArg::Local(nbytes));
        self
    }

    pub fn extend(mut self, other: KernelArgs) -> Self {
        self.args.extend(other.args);
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &DeviceBuffer> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(b) => Some(b),
            _ => None,
        })
    }

    pub(crate) fn into_vec(self) -> Vec<KernelArg> {
        self.args
    }
}

pub type HostFunction = dyn Fn(&mut WorkItem<'_>) + Send + Sync;

#[derive(Clone)]
pub enum ProgramSource {
    /// Rust closure executed once per work item by the host backend.
    Host(Arc<HostFunction>),

    /// Kernel source text compiled by the device's compiler.
    Text(Arc<str>),
}

impl fmt::Debug for ProgramSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramSource::Host(_) => write!(f, "Host(..)"),
            ProgramSource::Text(text) => write!(f, "Text({} bytes)", text.len()),
        }
    }
}

/// User code that can be turned into a [`Kernel`] for a device. Programs are identified by a
/// stable hash, which is the key of the per-device kernel cache.
#[derive(Clone, Debug)]
pub struct Program {
    name: Arc<str>,
    entry: Arc<str>,
    hash: u64,
    source: ProgramSource,
}

impl Program {
    pub fn host<F>(name: &str, fun: F) -> Self
    where
        F: Fn(&mut WorkItem<'_>) + Send + Sync + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        // Closures cannot be hashed, so every host program is unique.
        let mut hasher = fxhash::FxHasher64::default();
        name.hash(&mut hasher);
        NEXT_ID.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);

        Self {
            name: name.into(),
            entry: name.into(),
            hash: hasher.finish(),
            source: ProgramSource::Host(Arc::new(fun)),
        }
    }

    pub fn text(source: &str, entry: &str) -> Self {
        let mut hasher = fxhash::FxHasher64::default();
        source.hash(&mut hasher);
        entry.hash(&mut hasher);

        Self {
            name: entry.into(),
            entry: entry.into(),
            hash: hasher.finish(),
            source: ProgramSource::Text(source.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn source(&self) -> &ProgramSource {
        &self.source
    }
}

/// Compiled [`Program`] for one device. The contents are owned by the backend that built it.
#[derive(Clone)]
pub struct Kernel {
    program: u64,
    name: Arc<str>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Kernel {
    pub fn new(program: &Program, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            program: program.hash,
            name: Arc::clone(&program.name),
            inner,
        }
    }

    pub fn program_hash(&self) -> u64 {
        self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast<K: Any + Send + Sync>(&self) -> Option<&K> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("program", &self.program)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum ArgSlot {
    Buffer(usize),
    Value(SmallVec<[u8; 16]>),
    Local(usize),
}

/// View of a kernel launch from the perspective of a single work item of a host program.
pub struct WorkItem<'a> {
    pub(crate) global_id: [usize; 2],
    pub(crate) global_size: [usize; 2],
    pub(crate) local_id: [usize; 2],
    pub(crate) local_size: [usize; 2],
    pub(crate) offset: [usize; 2],
    pub(crate) args: Vec<ArgSlot>,
    pub(crate) buffers: Vec<&'a mut [u8]>,
    pub(crate) locals: Vec<Vec<u8>>,
}

impl<'a> WorkItem<'a> {
    /// Global index of this work item, including the launch offset.
    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id.get(dim).copied().unwrap_or(0) + self.offset.get(dim).copied().unwrap_or(0)
    }

    pub fn global_size(&self, dim: usize) -> usize {
        self.global_size.get(dim).copied().unwrap_or(1)
    }

    pub fn local_id(&self, dim: usize) -> usize {
        self.local_id.get(dim).copied().unwrap_or(0)
    }

    pub fn local_size(&self, dim: usize) -> usize {
        self.local_size.get(dim).copied().unwrap_or(1)
    }

    pub fn group_id(&self, dim: usize) -> usize {
        (self.global_id.get(dim).copied().unwrap_or(0)) / self.local_size(dim)
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn value<T: Element>(&self, arg: usize) -> T {
        match &self.args[arg] {
            ArgSlot::Value(bytes) => {
                assert_eq!(
                    bytes.len(),
                    T::size_in_bytes(),
                    "size mismatch for argument {}",
                    arg
                );
                load_element(bytes, 0)
            }
            other => panic!("argument {} is not a value: {:?}", arg, other),
        }
    }

    fn bytes(&self, arg: usize) -> &[u8] {
        match &self.args[arg] {
            ArgSlot::Buffer(index) => &*self.buffers[*index],
            ArgSlot::Local(index) => &self.locals[*index],
            ArgSlot::Value(_) => panic!("argument {} is not a buffer", arg),
        }
    }

    fn bytes_mut(&mut self, arg: usize) -> &mut [u8] {
        match &self.args[arg] {
            ArgSlot::Buffer(index) => &mut *self.buffers[*index],
            ArgSlot::Local(index) => &mut self.locals[*index],
            ArgSlot::Value(_) => panic!("argument {} is not a buffer", arg),
        }
    }

    /// Number of elements of type `T` in the buffer passed as argument `arg`.
    pub fn len<T: Element>(&self, arg: usize) -> usize {
        self.bytes(arg).len() / T::size_in_bytes()
    }

    pub fn load<T: Element>(&self, arg: usize, index: usize) -> T {
        load_element(self.bytes(arg), index)
    }

    pub fn store<T: Element>(&mut self, arg: usize, index: usize, value: T) {
        store_element(self.bytes_mut(arg), index, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_program_hash() {
        let a = Program::text("__global__ void f() {}", "f");
        let b = Program::text("__global__ void f() {}", "f");
        let c = Program::text("__global__ void g() {}", "g");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());

        let d = Program::host("f", |_| {});
        let e = Program::host("f", |_| {});
        assert_ne!(d.hash(), e.hash());
        assert_eq!(d.name(), "f");
    }

    #[test]
    fn test_kernel_args() {
        let args = KernelArgs::new().value(5u64).local(64).value(1.5f32);
        assert_eq!(args.len(), 3);
        assert_eq!(args.buffers().count(), 0);

        match &args.into_vec()[0] {
            KernelArg::Value(bytes) => assert_eq!(&bytes[..], &5u64.to_ne_bytes()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_work_item() {
        let mut data = vec![0u8; 16];
        let mut item = WorkItem {
            global_id: [3, 0],
            global_size: [8, 1],
            local_id: [1, 0],
            local_size: [2, 1],
            offset: [10, 0],
            args: vec![
                ArgSlot::Buffer(0),
                ArgSlot::Value(SmallVec::from_slice(&7u32.to_ne_bytes())),
            ],
            buffers: vec![&mut data[..]],
            locals: vec![],
        };

        assert_eq!(item.global_id(0), 13);
        assert_eq!(item.group_id(0), 1);
        assert_eq!(item.len::<u32>(0), 4);

        let v: u32 = item.value(1);
        item.store(0, 2, v);
        assert_eq!(item.load::<u32>(0, 2), 7);
    }
}
