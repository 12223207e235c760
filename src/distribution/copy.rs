//! Internals for [`CopyDist`].
use super::*;
use std::sync::Arc;

pub type CombineFn<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// Places a full copy of the container on every device.
///
/// If the copies diverge, the combine function merges them on download: the copy of the last
/// device is read into the host buffer and the copies of the other devices are merged into it
/// in ascending order as `host[i] = combine(copy[i], host[i])`.
#[derive(Clone)]
pub struct CopyDist<T> {
    pub(crate) devices: Vec<DeviceId>,
    combine: Option<CombineFn<T>>,
}

impl<T: Element> CopyDist<T> {
    pub fn new(devices: &[DeviceId], combine: Option<CombineFn<T>>) -> Self {
        Self {
            devices: devices.to_vec(),
            combine,
        }
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn combine(&self) -> Option<&CombineFn<T>> {
        self.combine.as_ref()
    }

    pub(crate) fn partition(&self, index: usize, shape: Shape) -> Partition {
        Partition {
            device: self.devices[index],
            owned_start: 0,
            owned_rows: shape.rows,
            halo_before: 0,
            halo_after: 0,
            columns: shape.columns,
        }
    }

    pub(crate) fn start_upload(
        &self,
        devices: &DeviceList,
        host: &[T],
        _shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        let mut events = EventSet::new();

        for &device in &self.devices {
            if host.is_empty() {
                continue;
            }

            let buffer = buffer_for(buffers, device)?;
            events.insert(devices[device].enqueue_write(buffer, 0, host)?);
        }

        Ok(events)
    }

    pub(crate) fn start_download(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        let mut plan = DownloadPlan::new();
        let len = shape.len();

        let (&last, others) = match self.devices.split_last() {
            Some(split) => split,
            None => return Err(DistributionError::NoDevices.into()),
        };

        let combine = match (&self.combine, others.is_empty()) {
            (_, true) => None,
            (Some(f), false) => Some(Arc::clone(f)),
            (None, false) => {
                return Err(DistributionError::MissingCombineFunction(self.devices.len()).into())
            }
        };

        if len == 0 {
            return Ok(plan);
        }

        let buffer = buffer_for(buffers, last)?;
        plan.read_into(devices[last].enqueue_read(buffer, 0, len)?, 0, len);

        if let Some(combine) = combine {
            for &device in others {
                let buffer = buffer_for(buffers, device)?;
                let event = devices[device].enqueue_read(buffer, 0, len)?;
                plan.merge(event, Arc::clone(&combine));
            }
        }

        Ok(plan)
    }

    pub(crate) fn convert<U: Element>(&self) -> CopyDist<U> {
        let combine = (&self.combine as &dyn Any)
            .downcast_ref::<Option<CombineFn<U>>>()
            .cloned()
            .flatten();

        CopyDist {
            devices: self.devices.clone(),
            combine,
        }
    }
}

impl<T> PartialEq for CopyDist<T> {
    fn eq(&self, other: &Self) -> bool {
        let same_combine = match (&self.combine, &other.combine) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };

        self.devices == other.devices && same_combine
    }
}

impl<T> fmt::Debug for CopyDist<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyDist")
            .field("devices", &self.devices)
            .field("combine", &self.combine.is_some())
            .finish()
    }
}
