//! Containers whose data lives on the host and on the devices at the same time.
//!
//! Each container keeps a host buffer, one buffer per device of its distribution and two flags
//! that tell which side holds the latest data. Data is moved lazily: reading on the host
//! downloads stale data and launching a skeleton uploads stale data.

mod matrix;
mod vector;

pub use matrix::Matrix;
pub use vector::Vector;

use parking_lot::{MappedMutexGuard, MutexGuard};
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::device::{DeviceBuffer, DeviceId, EventSet};
use crate::distribution::{DownloadPlan, Distribution, Partition};
use crate::prelude::*;
use crate::types::Shape;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("shapes {left} and {right} do not match")]
    ShapeMismatch { left: Shape, right: Shape },

    #[error("container is empty")]
    Empty,

    #[error("container of shape {0} has a zero-sized dimension")]
    ZeroSized(Shape),

    #[error("index {index} out of bounds for container of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("the same container cannot be used as {0}")]
    Aliased(&'static str),
}

struct State<T> {
    shape: Shape,
    distribution: Distribution<T>,
    buffers: IndexMap<DeviceId, DeviceBuffer>,
    host_up_to_date: bool,
    devices_up_to_date: bool,
}

impl<T> State<T> {
    fn check_flags(&self) {
        debug_assert!(
            self.host_up_to_date || self.devices_up_to_date,
            "neither host nor devices hold the data of the container"
        );
    }
}

/// Shared state of a [`Vector`] or [`Matrix`].
///
/// The host data sits behind its own lock. When both locks are taken, `state` is locked first.
#[doc(hidden)]
pub struct ContainerData<T> {
    context: Context,
    state: Mutex<State<T>>,
    host: Mutex<Vec<T>>,
}

impl<T: Element> ContainerData<T> {
    pub(crate) fn new(context: &Context, shape: Shape, host: Vec<T>) -> Self {
        assert_eq!(shape.len(), host.len());

        Self {
            context: context.clone(),
            state: Mutex::new(State {
                shape,
                distribution: Distribution::Default,
                buffers: default(),
                host_up_to_date: true,
                devices_up_to_date: false,
            }),
            host: Mutex::new(host),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn shape(&self) -> Shape {
        self.state.lock().shape
    }

    pub fn distribution(&self) -> Distribution<T> {
        self.state.lock().distribution.clone()
    }

    pub fn host_up_to_date(&self) -> bool {
        self.state.lock().host_up_to_date
    }

    pub fn devices_up_to_date(&self) -> bool {
        self.state.lock().devices_up_to_date
    }

    pub fn partitions(&self) -> Vec<Partition> {
        let state = self.state.lock();
        state.distribution.partitions(state.shape)
    }

    /// Download the device data if the host copy is stale.
    fn sync_host(&self, state: &mut State<T>) -> Result {
        if state.host_up_to_date {
            return Ok(());
        }

        trace!("downloading {:?} container", state.shape);
        let plan = state.distribution.start_download(
            self.context.devices(),
            state.shape,
            &state.buffers,
        )?;

        Self::finish_download(state, &mut self.host.lock(), plan)
    }

    fn finish_download(state: &mut State<T>, host: &mut [T], plan: DownloadPlan<T>) -> Result {
        let host_modified = plan.marks_host_modified();
        plan.wait(host)?;

        state.host_up_to_date = true;
        if host_modified {
            state.devices_up_to_date = false;
        }

        state.check_flags();
        Ok(())
    }

    /// Replace the distribution. If the new distribution needs a different layout on the
    /// devices, the data is first brought to the host and the device buffers are released.
    pub fn set_distribution(&self, distribution: Distribution<T>) -> Result {
        distribution.check_valid()?;
        let mut state = self.state.lock();

        if state.distribution == distribution {
            return Ok(());
        }

        if distribution.data_exchange_on_distribution_change(&state.distribution, state.shape) {
            debug!(
                "changing distribution of {:?} container from {:?} to {:?}",
                state.shape, state.distribution, distribution
            );

            self.sync_host(&mut state)?;
            state.buffers.clear();
            state.devices_up_to_date = false;
        }

        state.distribution = distribution;
        state.check_flags();
        Ok(())
    }

    /// Create the device buffers unless they already exist.
    pub fn create_device_buffers(&self) -> Result {
        let mut state = self.state.lock();

        if state.buffers.is_empty() {
            self.allocate_buffers(&mut state)?;
        }

        Ok(())
    }

    /// Create new device buffers, even if they already exist.
    pub fn force_create_device_buffers(&self) -> Result {
        let mut state = self.state.lock();
        self.allocate_buffers(&mut state)
    }

    fn allocate_buffers(&self, state: &mut State<T>) -> Result {
        state.distribution.check_valid()?;
        self.sync_host(state)?;

        state.buffers.clear();
        state.devices_up_to_date = false;

        for p in state.distribution.partitions(state.shape) {
            let device = self.context.device(p.device)?;
            let buffer = device.create_buffer::<T>(p.buffer_len())?;
            state.buffers.insert(p.device, buffer);
        }

        debug!(
            "created {} device buffers for {:?} container ({})",
            state.buffers.len(),
            state.shape,
            state.distribution.kind()
        );

        state.check_flags();
        Ok(())
    }

    /// Start copying the host data to the devices. Returns an empty set if the devices are
    /// already up to date.
    pub fn start_upload(&self) -> Result<EventSet> {
        let mut state = self.state.lock();

        if state.devices_up_to_date {
            return Ok(EventSet::new());
        }

        if state.buffers.is_empty() {
            self.allocate_buffers(&mut state)?;
        }

        trace!("uploading {:?} container", state.shape);
        let events = state.distribution.start_upload(
            self.context.devices(),
            &self.host.lock(),
            state.shape,
            &state.buffers,
        )?;

        state.devices_up_to_date = true;
        Ok(events)
    }

    pub fn copy_data_to_devices(&self) -> Result {
        self.start_upload()?.wait()
    }

    /// Start copying the device data to the host. The host buffer is updated when the returned
    /// download is waited on.
    pub fn start_download(self: Arc<Self>) -> Result<PendingDownload<T>> {
        let plan = {
            let state = self.state.lock();

            if state.host_up_to_date {
                None
            } else {
                Some(state.distribution.start_download(
                    self.context.devices(),
                    state.shape,
                    &state.buffers,
                )?)
            }
        };

        Ok(PendingDownload { data: self, plan })
    }

    pub fn copy_data_to_host(&self) -> Result {
        let mut state = self.state.lock();
        self.sync_host(&mut state)
    }

    /// The devices now hold the latest data.
    pub fn data_on_device_modified(&self) {
        let mut state = self.state.lock();
        assert!(
            !state.buffers.is_empty(),
            "container has no device buffers that could have been modified"
        );

        state.devices_up_to_date = true;
        state.host_up_to_date = false;
    }

    /// The host now holds the latest data.
    pub fn data_on_host_modified(&self) {
        let mut state = self.state.lock();
        state.host_up_to_date = true;
        state.devices_up_to_date = false;
    }

    /// Buffer of `device`. Panics if no buffer has been created for that device.
    pub fn device_buffer(&self, device: DeviceId) -> DeviceBuffer {
        match self.state.lock().buffers.get(&device) {
            Some(buffer) => buffer.clone(),
            None => panic!("container has no buffer on device {}", device),
        }
    }

    pub fn device_buffers(&self) -> IndexMap<DeviceId, DeviceBuffer> {
        self.state.lock().buffers.clone()
    }

    /// Host data, downloaded first if it is stale.
    ///
    /// The guard locks only the host data. Shape, distribution, flags and device buffers can
    /// still be queried while it is alive, but accessors of the host data (`get`, `set`,
    /// `to_vec`, uploads) block until it is dropped.
    pub fn host_buffer(&self) -> Result<MappedMutexGuard<'_, [T]>> {
        let mut state = self.state.lock();
        self.sync_host(&mut state)?;

        let host = self.host.lock();
        drop(state);
        Ok(MutexGuard::map(host, |h| &mut h[..]))
    }

    /// Mutable host data. The device copies are considered stale afterwards. Locks the same way
    /// as [`ContainerData::host_buffer`].
    pub fn host_buffer_mut(&self) -> Result<MappedMutexGuard<'_, [T]>> {
        let mut state = self.state.lock();
        self.sync_host(&mut state)?;

        state.host_up_to_date = true;
        state.devices_up_to_date = false;

        let host = self.host.lock();
        drop(state);
        Ok(MutexGuard::map(host, |h| &mut h[..]))
    }

    pub fn get(&self, index: usize) -> Result<T> {
        let host = self.host_buffer()?;

        match host.get(index) {
            Some(value) => Ok(*value),
            None => Err(ContainerError::OutOfBounds {
                index,
                len: host.len(),
            }
            .into()),
        }
    }

    pub fn set(&self, index: usize, value: T) -> Result {
        let mut host = self.host_buffer_mut()?;
        let len = host.len();

        match host.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ContainerError::OutOfBounds { index, len }.into()),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.host_buffer()?.to_vec())
    }

    /// Change the shape. Elements at positions that exist in both shapes are kept, new
    /// positions are filled with `value`. The device buffers are released.
    pub fn resize(&self, shape: Shape, value: T) -> Result {
        let mut state = self.state.lock();

        if state.shape == shape {
            return Ok(());
        }

        self.sync_host(&mut state)?;
        let old = state.shape;
        let mut host = self.host.lock();

        if old.columns == shape.columns {
            host.resize(shape.len(), value);
        } else {
            let mut resized = vec![value; shape.len()];
            for row in 0..min(old.rows, shape.rows) {
                for column in 0..min(old.columns, shape.columns) {
                    resized[row * shape.columns + column] = host[row * old.columns + column];
                }
            }
            *host = resized;
        }

        state.shape = shape;
        state.buffers.clear();
        state.host_up_to_date = true;
        state.devices_up_to_date = false;
        Ok(())
    }

    /// Discard the contents and give the container a new shape and distribution, with device
    /// buffers ready to be written by a kernel.
    pub(crate) fn prepare_output(&self, shape: Shape, distribution: Distribution<T>) -> Result {
        {
            let mut state = self.state.lock();

            if state.shape != shape {
                state.shape = shape;
                *self.host.lock() = vec![T::default(); shape.len()];
                state.buffers.clear();
                state.host_up_to_date = true;
                state.devices_up_to_date = false;
            }
        }

        self.set_distribution(distribution)?;
        self.create_device_buffers()
    }

    /// Independent copy of this container. If only the devices hold the latest data, the copy
    /// is made on the devices.
    pub fn duplicate(&self) -> Result<Self> {
        let state = self.state.lock();
        let mut buffers = IndexMap::default();

        if !state.host_up_to_date {
            let mut events = EventSet::new();

            for (&id, src) in &state.buffers {
                let device = self.context.device(id)?;
                let dst = device.create_buffer::<T>(src.size())?;
                events.insert(device.enqueue_copy(src, 0, &dst, 0, src.size())?);
                buffers.insert(id, dst);
            }

            events.wait()?;
        }

        let devices_up_to_date = !buffers.is_empty() && state.devices_up_to_date;

        Ok(Self {
            context: self.context.clone(),
            state: Mutex::new(State {
                shape: state.shape,
                distribution: state.distribution.clone(),
                buffers,
                host_up_to_date: state.host_up_to_date,
                devices_up_to_date,
            }),
            host: Mutex::new(self.host.lock().clone()),
        })
    }
}

impl<T: Element> fmt::Debug for ContainerData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("ContainerData")
            .field("shape", &state.shape)
            .field("distribution", &state.distribution)
            .field("buffers", &state.buffers.len())
            .field("host_up_to_date", &state.host_up_to_date)
            .field("devices_up_to_date", &state.devices_up_to_date)
            .finish()
    }
}

/// Download started by [`Container::start_download`].
#[must_use]
pub struct PendingDownload<T: Element> {
    data: Arc<ContainerData<T>>,
    plan: Option<DownloadPlan<T>>,
}

impl<T: Element> PendingDownload<T> {
    /// Block until the data has arrived in the host buffer of the container.
    pub fn wait(self) -> Result {
        let plan = match self.plan {
            Some(plan) => plan,
            None => return Ok(()),
        };

        let mut state = self.data.state.lock();
        let mut host = self.data.host.lock();
        ContainerData::finish_download(&mut state, &mut host, plan)
    }
}

/// Operations shared by [`Vector`] and [`Matrix`].
pub trait Container<T: Element> {
    #[doc(hidden)]
    fn data(&self) -> &Arc<ContainerData<T>>;

    fn context(&self) -> &Context {
        self.data().context()
    }

    fn shape(&self) -> Shape {
        self.data().shape()
    }

    fn len(&self) -> usize {
        self.shape().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn distribution(&self) -> Distribution<T> {
        self.data().distribution()
    }

    fn set_distribution(&self, distribution: Distribution<T>) -> Result {
        self.data().set_distribution(distribution)
    }

    /// Part of the container assigned to each device of the current distribution.
    fn partitions(&self) -> Vec<Partition> {
        self.data().partitions()
    }

    fn create_device_buffers(&self) -> Result {
        self.data().create_device_buffers()
    }

    fn force_create_device_buffers(&self) -> Result {
        self.data().force_create_device_buffers()
    }

    fn start_upload(&self) -> Result<EventSet> {
        self.data().start_upload()
    }

    fn copy_data_to_devices(&self) -> Result {
        self.data().copy_data_to_devices()
    }

    fn start_download(&self) -> Result<PendingDownload<T>> {
        Arc::clone(self.data()).start_download()
    }

    fn copy_data_to_host(&self) -> Result {
        self.data().copy_data_to_host()
    }

    fn data_on_device_modified(&self) {
        self.data().data_on_device_modified()
    }

    fn data_on_host_modified(&self) {
        self.data().data_on_host_modified()
    }

    fn device_buffer(&self, device: DeviceId) -> DeviceBuffer {
        self.data().device_buffer(device)
    }

    fn host_buffer(&self) -> Result<MappedMutexGuard<'_, [T]>> {
        self.data().host_buffer()
    }

    fn host_buffer_mut(&self) -> Result<MappedMutexGuard<'_, [T]>> {
        self.data().host_buffer_mut()
    }

    fn host_up_to_date(&self) -> bool {
        self.data().host_up_to_date()
    }

    fn devices_up_to_date(&self) -> bool {
        self.data().devices_up_to_date()
    }

    fn to_vec(&self) -> Result<Vec<T>> {
        self.data().to_vec()
    }

    /// `true` if both handles refer to the same container.
    fn same_container(&self, other: &dyn Container<T>) -> bool {
        Arc::ptr_eq(self.data(), other.data())
    }
}
