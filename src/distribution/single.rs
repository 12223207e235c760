//! Internals for [`SingleDist`].
use super::*;

/// Places the whole container on one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SingleDist {
    pub(crate) device: DeviceId,
}

impl SingleDist {
    pub fn new(device: DeviceId) -> Self {
        Self { device }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn partition(&self, index: usize, shape: Shape) -> Partition {
        assert_eq!(index, 0, "single distribution has only one partition");

        Partition {
            device: self.device,
            owned_start: 0,
            owned_rows: shape.rows,
            halo_before: 0,
            halo_after: 0,
            columns: shape.columns,
        }
    }

    pub(crate) fn start_upload<T: Element>(
        &self,
        devices: &DeviceList,
        host: &[T],
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        upload_rows(devices, &[self.partition(0, shape)], host, shape, buffers)
    }

    pub(crate) fn start_download<T: Element>(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        download_owned(devices, &[self.partition(0, shape)], buffers)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::round_trip;
    use super::*;
    use crate::Context;

    #[test]
    fn test_round_trip() {
        let context = Context::host(2).unwrap();
        let dist = Distribution::<u64>::single(DeviceId(1));
        let shape = Shape::new(5, 3);

        assert_eq!(dist.size_for_device(DeviceId(0), shape), 0);
        assert_eq!(dist.size_for_device(DeviceId(1), shape), 15);

        let host = (100..115).collect_vec();
        let (buffers, output) = round_trip(&context, &dist, shape, &host);
        assert_eq!(output, host);
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[&DeviceId(1)].size(), 15);
    }
}
