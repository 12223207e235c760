//! Strategies that decide how the rows of a container are spread over the devices.
//!
//! Every strategy is described by [`Distribution::partition`], which tells for each participating
//! device which rows it owns and how many halo rows surround them. Upload, download, kernel
//! launches and halo swaps are all derived from this single geometry.

mod block;
mod copy;
mod overlap;
mod single;
mod stencil;

#[doc(inline)]
pub use block::{block_rows, BlockDist};
#[doc(inline)]
pub use copy::{CombineFn, CopyDist};
#[doc(inline)]
pub use overlap::OverlapDist;
#[doc(inline)]
pub use single::SingleDist;
#[doc(inline)]
pub use stencil::{Extents, StencilDist};

use parskel_core::{as_bytes, Element};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

use crate::device::{DeviceBuffer, DeviceId, DeviceList, EventSet, ReadEvent};
use crate::prelude::*;
use crate::types::Shape;

/// Values used for rows and columns that lie outside of the container.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Padding {
    /// Repeat the nearest element inside the container.
    Nearest,

    /// Use the neutral element.
    Neutral,

    /// Repeat the nearest element of the initial input of an iterative computation. Within the
    /// device buffers of a distribution this behaves like `Neutral`.
    NearestInitial,
}

impl Padding {
    /// Encoding passed to kernels.
    pub fn to_u32(self) -> u32 {
        match self {
            Padding::Nearest => 0,
            Padding::Neutral => 1,
            Padding::NearestInitial => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Padding::Nearest),
            1 => Some(Padding::Neutral),
            2 => Some(Padding::NearestInitial),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("container has no valid distribution")]
    Invalid,

    #[error("distribution has no devices")]
    NoDevices,

    #[error("device {0} appears more than once in the distribution")]
    DuplicateDevice(DeviceId),

    #[error("invalid significances {0:?}: expected non-negative values summing to one")]
    InvalidSignificances(Vec<f64>),

    #[error("copy distribution over {0} devices has no combine function to merge the copies")]
    MissingCombineFunction(usize),

    #[error("partitions of {shape} over {devices} devices are too small for halos of {north} rows north and {south} rows south")]
    PartitionTooSmall {
        shape: Shape,
        devices: usize,
        north: usize,
        south: usize,
    },

    #[error("iterations between swaps must be at least one")]
    InvalidSwapInterval,
}

/// Rows of a container held by one device.
///
/// The device buffer starts with `halo_before` rows preceding the owned rows and ends with
/// `halo_after` rows following them. Halo rows that fall outside of the container are padding.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Partition {
    pub device: DeviceId,
    pub owned_start: usize,
    pub owned_rows: usize,
    pub halo_before: usize,
    pub halo_after: usize,
    pub columns: usize,
}

impl Partition {
    pub fn owned_end(&self) -> usize {
        self.owned_start + self.owned_rows
    }

    /// Global index of the first row in the buffer. Negative if the buffer starts with padding.
    pub fn first_row(&self) -> isize {
        self.owned_start as isize - self.halo_before as isize
    }

    pub fn buffer_rows(&self) -> usize {
        self.halo_before + self.owned_rows + self.halo_after
    }

    /// Number of elements in the device buffer.
    pub fn buffer_len(&self) -> usize {
        self.buffer_rows() * self.columns
    }

    /// Element offset of the first owned row within the device buffer.
    pub fn owned_offset(&self) -> usize {
        self.halo_before * self.columns
    }

    pub fn owned_len(&self) -> usize {
        self.owned_rows * self.columns
    }

    pub fn has_halo(&self) -> bool {
        self.halo_before > 0 || self.halo_after > 0
    }
}

/// Pending download of the device buffers into a host buffer.
#[must_use]
pub struct DownloadPlan<T> {
    reads: Vec<(ReadEvent, usize, usize)>,
    merges: Vec<ReadEvent>,
    combine: Option<CombineFn<T>>,
    host_modified: bool,
}

impl<T: Element> DownloadPlan<T> {
    pub(crate) fn new() -> Self {
        Self {
            reads: vec![],
            merges: vec![],
            combine: None,
            host_modified: false,
        }
    }

    /// Read the next `len` elements at `host_offset` of the host buffer.
    pub(crate) fn read_into(&mut self, event: ReadEvent, host_offset: usize, len: usize) {
        self.reads.push((event, host_offset, len));
    }

    /// Combine the result of `event` element-wise into the host buffer once all plain reads
    /// have finished. Merges are applied in the order they are added.
    pub(crate) fn merge(&mut self, event: ReadEvent, combine: CombineFn<T>) {
        self.merges.push(event);
        self.combine = Some(combine);
    }

    pub(crate) fn mark_host_modified(&mut self) {
        self.host_modified = true;
    }

    /// `true` if the container should consider its host buffer as the only up-to-date copy
    /// after this download.
    pub fn marks_host_modified(&self) -> bool {
        self.host_modified
    }

    /// Block until all reads have finished and write the result into `host`.
    pub fn wait(self, host: &mut [T]) -> Result {
        for (event, offset, len) in self.reads {
            event.wait_into(&mut host[offset..offset + len])?;
        }

        if let Some(combine) = self.combine {
            for event in self.merges {
                let other: Vec<T> = event.wait_vec()?;
                ensure!(
                    other.len() == host.len(),
                    "copy of {} elements does not match host buffer of {} elements",
                    other.len(),
                    host.len()
                );

                for (dst, src) in zip(host.iter_mut(), other) {
                    *dst = (combine)(src, *dst);
                }
            }
        }

        Ok(())
    }
}

impl<T> fmt::Debug for DownloadPlan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadPlan")
            .field("reads", &self.reads.len())
            .field("merges", &self.merges.len())
            .field("host_modified", &self.host_modified)
            .finish()
    }
}

/// How the data of a container is spread over the devices.
///
/// `Default` is the state of a container that has not been used on a device yet. It is not a
/// valid distribution: skeletons replace it before touching any device buffer.
pub enum Distribution<T> {
    Default,
    Single(SingleDist),
    Block(BlockDist),
    Copy(CopyDist<T>),
    Overlap(OverlapDist<T>),
    Stencil(StencilDist<T>),
}

impl<T> Default for Distribution<T> {
    fn default() -> Self {
        Distribution::Default
    }
}

impl<T> Clone for Distribution<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        use Distribution::*;

        match self {
            Default => Default,
            Single(d) => Single(d.clone()),
            Block(d) => Block(d.clone()),
            Copy(d) => Copy(d.clone()),
            Overlap(d) => Overlap(d.clone()),
            Stencil(d) => Stencil(d.clone()),
        }
    }
}

impl<T: Element> Distribution<T> {
    pub fn single(device: DeviceId) -> Self {
        Distribution::Single(SingleDist::new(device))
    }

    /// Block distribution with the same share for every device.
    pub fn block(devices: &[DeviceId]) -> Self {
        Distribution::Block(BlockDist::new(devices))
    }

    pub fn block_with_significances(devices: &[DeviceId], significances: &[f64]) -> Result<Self> {
        Ok(Distribution::Block(BlockDist::with_significances(
            devices,
            significances,
        )?))
    }

    pub fn copy(devices: &[DeviceId]) -> Self {
        Distribution::Copy(CopyDist::new(devices, None))
    }

    pub fn copy_with_combine<F>(devices: &[DeviceId], combine: F) -> Self
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        Distribution::Copy(CopyDist::new(devices, Some(std::sync::Arc::new(combine))))
    }

    pub fn overlap(devices: &[DeviceId], radius: usize, padding: Padding, neutral: T) -> Self {
        Distribution::Overlap(OverlapDist::new(
            BlockDist::new(devices),
            radius,
            padding,
            neutral,
        ))
    }

    pub fn stencil(devices: &[DeviceId], extents: Extents, padding: Padding, neutral: T) -> Self {
        Distribution::Stencil(StencilDist::new(devices, extents, padding, neutral))
    }

    /// A distribution is valid if it is one of the concrete variants and has at least one device.
    pub fn is_valid(&self) -> bool {
        !self.devices().is_empty()
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Distribution::Default)
    }

    pub fn devices(&self) -> &[DeviceId] {
        use Distribution::*;

        match self {
            Default => &[],
            Single(d) => std::slice::from_ref(&d.device),
            Block(d) => &d.devices,
            Copy(d) => &d.devices,
            Overlap(d) => &d.block.devices,
            Stencil(d) => &d.devices,
        }
    }

    pub fn kind(&self) -> &'static str {
        use Distribution::*;

        match self {
            Default => "default",
            Single(_) => "single",
            Block(_) => "block",
            Copy(_) => "copy",
            Overlap(_) => "overlap",
            Stencil(_) => "stencil",
        }
    }

    pub(crate) fn check_valid(&self) -> Result {
        if self.is_default() {
            return Err(DistributionError::Invalid.into());
        }

        let devices = self.devices();
        if devices.is_empty() {
            return Err(DistributionError::NoDevices.into());
        }

        for (i, d) in enumerate(devices) {
            if devices[..i].contains(d) {
                return Err(DistributionError::DuplicateDevice(*d).into());
            }
        }

        Ok(())
    }

    /// Geometry of the buffer of the `index`-th device of this distribution.
    pub fn partition(&self, index: usize, shape: Shape) -> Partition {
        use Distribution::*;

        match self {
            Default => panic!("default distribution has no partitions"),
            Single(d) => d.partition(index, shape),
            Block(d) => d.partition(index, shape),
            Copy(d) => d.partition(index, shape),
            Overlap(d) => d.partition(index, shape),
            Stencil(d) => d.partition(index, shape),
        }
    }

    pub fn partitions(&self, shape: Shape) -> Vec<Partition> {
        (0..self.devices().len())
            .map(|i| self.partition(i, shape))
            .collect()
    }

    /// Number of elements in the buffer of `device`, or zero if the device does not take part.
    pub fn size_for_device(&self, device: DeviceId, shape: Shape) -> usize {
        match self.devices().iter().position(|d| *d == device) {
            Some(index) => self.partition(index, shape).buffer_len(),
            None => 0,
        }
    }

    /// Enqueue writes of `host` into the buffer of every participating device.
    pub fn start_upload(
        &self,
        devices: &DeviceList,
        host: &[T],
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        use Distribution::*;
        self.check_valid()?;
        assert_eq!(host.len(), shape.len());

        match self {
            Default => unreachable!(),
            Single(d) => d.start_upload(devices, host, shape, buffers),
            Block(d) => d.start_upload(devices, host, shape, buffers),
            Copy(d) => d.start_upload(devices, host, shape, buffers),
            Overlap(d) => d.start_upload(devices, host, shape, buffers),
            Stencil(d) => d.start_upload(devices, host, shape, buffers),
        }
    }

    /// Enqueue reads of the device buffers. The returned plan assembles the host buffer.
    pub fn start_download(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        use Distribution::*;
        self.check_valid()?;

        match self {
            Default => unreachable!(),
            Single(d) => d.start_download(devices, shape, buffers),
            Block(d) => d.start_download(devices, shape, buffers),
            Copy(d) => d.start_download(devices, shape, buffers),
            Overlap(d) => d.start_download(devices, shape, buffers),
            Stencil(d) => d.start_download(devices, shape, buffers),
        }
    }

    /// Returns `true` if switching from `old` to this distribution requires the data to travel
    /// through the host, i.e. the device set or the per-device layout differ.
    pub fn data_exchange_on_distribution_change(&self, old: &Distribution<T>, shape: Shape) -> bool {
        if !old.is_valid() || self == old {
            return false;
        }

        if self.devices() != old.devices() {
            return true;
        }

        // Equal layouts without halos hold the same data on every device. Halos depend on
        // padding and neutral values, so those only match if the distributions are equal.
        let new = self.partitions(shape);
        let old = old.partitions(shape);
        new != old || new.iter().any(Partition::has_halo)
    }

    /// Same layout for a container with a different element type.
    ///
    /// The combine function and the neutral element are only kept if `U` is `T`. Otherwise the
    /// combine function is dropped and the neutral element becomes `U::default()`.
    pub fn convert<U: Element>(&self) -> Distribution<U> {
        use Distribution::*;

        match self {
            Default => Default,
            Single(d) => Single(d.clone()),
            Block(d) => Block(d.clone()),
            Copy(d) => Copy(d.convert()),
            Overlap(d) => Overlap(d.convert()),
            Stencil(d) => Stencil(d.convert()),
        }
    }
}

/// Converts a value of type `T` into `U` if both are the same type.
pub(crate) fn convert_neutral<T: Element, U: Element>(value: &T) -> U {
    (value as &dyn Any)
        .downcast_ref::<U>()
        .copied()
        .unwrap_or_default()
}

pub(crate) fn same_value<T: Element>(a: &T, b: &T) -> bool {
    as_bytes(std::slice::from_ref(a)) == as_bytes(std::slice::from_ref(b))
}

pub(crate) fn buffer_for<'a>(
    buffers: &'a IndexMap<DeviceId, DeviceBuffer>,
    device: DeviceId,
) -> Result<&'a DeviceBuffer> {
    buffers
        .get(&device)
        .ok_or_else(|| anyhow!("no buffer has been created for device {}", device))
}

/// Plain upload: each device receives the rows of its buffer that lie within the container.
/// Rows outside of the container are left untouched.
pub(crate) fn upload_rows<T: Element>(
    devices: &DeviceList,
    partitions: &[Partition],
    host: &[T],
    shape: Shape,
    buffers: &IndexMap<DeviceId, DeviceBuffer>,
) -> Result<EventSet> {
    let mut events = EventSet::new();

    for p in partitions {
        let first = max(p.first_row(), 0) as usize;
        let last = min(p.owned_end() + p.halo_after, shape.rows);
        if first >= last {
            continue;
        }

        let offset = (first as isize - p.first_row()) as usize * p.columns;
        let data = &host[first * p.columns..last * p.columns];

        let buffer = buffer_for(buffers, p.device)?;
        events.insert(devices[p.device].enqueue_write(buffer, offset, data)?);
    }

    Ok(events)
}

/// Plain download: each device contributes its owned rows.
pub(crate) fn download_owned<T: Element>(
    devices: &DeviceList,
    partitions: &[Partition],
    buffers: &IndexMap<DeviceId, DeviceBuffer>,
) -> Result<DownloadPlan<T>> {
    let mut plan = DownloadPlan::new();

    for p in partitions {
        if p.owned_rows == 0 {
            continue;
        }

        let buffer = buffer_for(buffers, p.device)?;
        let event = devices[p.device].enqueue_read(buffer, p.owned_offset(), p.owned_len())?;
        plan.read_into(event, p.owned_start * p.columns, p.owned_len());
    }

    Ok(plan)
}

impl<T: Element> PartialEq for Distribution<T> {
    fn eq(&self, other: &Self) -> bool {
        use Distribution::*;

        match (self, other) {
            (Default, Default) => true,
            (Single(a), Single(b)) => a == b,
            (Block(a), Block(b)) => a == b,
            (Copy(a), Copy(b)) => a == b,
            (Overlap(a), Overlap(b)) => a == b,
            (Stencil(a), Stencil(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Element> fmt::Debug for Distribution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Distribution::*;

        match self {
            Default => write!(f, "Default"),
            Single(d) => fmt::Debug::fmt(d, f),
            Block(d) => fmt::Debug::fmt(d, f),
            Copy(d) => fmt::Debug::fmt(d, f),
            Overlap(d) => fmt::Debug::fmt(d, f),
            Stencil(d) => fmt::Debug::fmt(d, f),
        }
    }
}
