//! Internals for [`StencilDist`].
use super::*;
use std::ops::Add;

/// Number of neighboring rows and columns a stencil reads in each direction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Extents {
    pub north: usize,
    pub west: usize,
    pub south: usize,
    pub east: usize,
}

impl Extents {
    pub const fn new(north: usize, west: usize, south: usize, east: usize) -> Self {
        Self {
            north,
            west,
            south,
            east,
        }
    }

    pub const fn uniform(radius: usize) -> Self {
        Self::new(radius, radius, radius, radius)
    }
}

impl Add for Extents {
    type Output = Extents;

    fn add(self, other: Extents) -> Extents {
        Extents {
            north: self.north + other.north,
            west: self.west + other.west,
            south: self.south + other.south,
            east: self.east + other.east,
        }
    }
}

/// Splits the rows evenly among the devices (the last device also receives the remainder) and
/// gives every device enough halo rows from its neighbors to run `iterations_between_swaps`
/// iterations before the halos have to be refreshed by a [`swap`](StencilDist::swap).
///
/// Only `north` and `south` create halo rows. Columns are never split, so `west` and `east`
/// are handled by the kernels.
#[derive(Clone)]
pub struct StencilDist<T> {
    pub(crate) devices: Vec<DeviceId>,
    extents: Extents,
    padding: Padding,
    neutral: T,
    iterations_between_swaps: usize,
}

impl<T: Element> StencilDist<T> {
    pub fn new(devices: &[DeviceId], extents: Extents, padding: Padding, neutral: T) -> Self {
        Self {
            devices: devices.to_vec(),
            extents,
            padding,
            neutral,
            iterations_between_swaps: 1,
        }
    }

    pub fn with_iterations_between_swaps(mut self, iterations: usize) -> Result<Self> {
        if iterations == 0 {
            return Err(DistributionError::InvalidSwapInterval.into());
        }

        self.iterations_between_swaps = iterations;
        Ok(self)
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn neutral(&self) -> T {
        self.neutral
    }

    pub fn iterations_between_swaps(&self) -> usize {
        self.iterations_between_swaps
    }

    fn owned(&self, index: usize, rows: usize) -> (usize, usize) {
        let n = self.devices.len();
        let base = rows / n;

        if index + 1 == n {
            (index * base, rows - index * base)
        } else {
            (index * base, base)
        }
    }

    pub(crate) fn partition(&self, index: usize, shape: Shape) -> Partition {
        let n = self.devices.len();
        let s = self.iterations_between_swaps;
        let (owned_start, owned_rows) = self.owned(index, shape.rows);
        let owned_end = owned_start + owned_rows;

        let halo_before = if index > 0 {
            min(s * self.extents.north, owned_start)
        } else {
            0
        };

        let halo_after = if index + 1 < n {
            min(s * self.extents.south, shape.rows - owned_end)
        } else {
            0
        };

        Partition {
            device: self.devices[index],
            owned_start,
            owned_rows,
            halo_before,
            halo_after,
            columns: shape.columns,
        }
    }

    fn partitions(&self, shape: Shape) -> Vec<Partition> {
        (0..self.devices.len())
            .map(|i| self.partition(i, shape))
            .collect()
    }

    /// Largest number of iterations between two swaps for which every halo can be filled from
    /// the rows owned by the neighboring device.
    pub fn max_iterations_between_swaps(&self, shape: Shape) -> Result<usize> {
        let Extents { north, south, .. } = self.extents;
        let n = self.devices.len();
        let mut limit = usize::MAX;

        for index in 1..n {
            let (_, above) = self.owned(index - 1, shape.rows);
            let (_, below) = self.owned(index, shape.rows);

            if north > 0 {
                limit = min(limit, above / north);
            }

            if south > 0 {
                limit = min(limit, below / south);
            }
        }

        if limit == 0 {
            return Err(DistributionError::PartitionTooSmall {
                shape,
                devices: n,
                north,
                south,
            }
            .into());
        }

        Ok(limit)
    }

    pub(crate) fn start_upload(
        &self,
        devices: &DeviceList,
        host: &[T],
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        upload_rows(devices, &self.partitions(shape), host, shape, buffers)
    }

    pub(crate) fn start_download(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        download_owned(devices, &self.partitions(shape), buffers)
    }

    /// Refresh the halo rows of every device with the owned rows of its neighbors.
    ///
    /// Blocks until the new halos have been written.
    pub fn swap(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result {
        let partitions = self.partitions(shape);
        let columns = shape.columns;
        let mut reads = vec![];

        for (index, p) in enumerate(&partitions) {
            if p.halo_before > 0 {
                let above = &partitions[index - 1];
                ensure!(
                    above.owned_rows >= p.halo_before,
                    DistributionError::PartitionTooSmall {
                        shape,
                        devices: partitions.len(),
                        north: self.extents.north,
                        south: self.extents.south,
                    }
                );

                let offset = above.owned_offset() + (above.owned_rows - p.halo_before) * columns;
                let event = devices[above.device].enqueue_read(
                    buffer_for(buffers, above.device)?,
                    offset,
                    p.halo_before * columns,
                )?;

                reads.push((event, p.device, 0));
            }

            if p.halo_after > 0 {
                let below = &partitions[index + 1];
                ensure!(
                    below.owned_rows >= p.halo_after,
                    DistributionError::PartitionTooSmall {
                        shape,
                        devices: partitions.len(),
                        north: self.extents.north,
                        south: self.extents.south,
                    }
                );

                let event = devices[below.device].enqueue_read(
                    buffer_for(buffers, below.device)?,
                    below.owned_offset(),
                    p.halo_after * columns,
                )?;

                reads.push((event, p.device, p.owned_offset() + p.owned_len()));
            }
        }

        trace!("swapping {} halos of {:?}", reads.len(), shape);

        let mut slices = vec![];
        for (event, device, offset) in reads {
            slices.push((event.wait_vec::<T>()?, device, offset));
        }

        let mut writes = EventSet::new();
        for (data, device, offset) in slices {
            let buffer = buffer_for(buffers, device)?;
            writes.insert(devices[device].enqueue_write(buffer, offset, &data)?);
        }

        writes.wait()
    }

    pub(crate) fn convert<U: Element>(&self) -> StencilDist<U> {
        StencilDist {
            devices: self.devices.clone(),
            extents: self.extents,
            padding: self.padding,
            neutral: convert_neutral(&self.neutral),
            iterations_between_swaps: self.iterations_between_swaps,
        }
    }
}

impl<T: Element> PartialEq for StencilDist<T> {
    fn eq(&self, other: &Self) -> bool {
        self.devices == other.devices
            && self.extents == other.extents
            && self.padding == other.padding
            && same_value(&self.neutral, &other.neutral)
            && self.iterations_between_swaps == other.iterations_between_swaps
    }
}

impl<T: Element> fmt::Debug for StencilDist<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StencilDist")
            .field("devices", &self.devices)
            .field("extents", &self.extents)
            .field("padding", &self.padding)
            .field("neutral", &self.neutral)
            .field("iterations_between_swaps", &self.iterations_between_swaps)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{ids, read_buffer, round_trip};
    use super::*;
    use crate::Context;

    fn dist(n: usize, extents: Extents, iterations: usize) -> StencilDist<i32> {
        StencilDist::new(&ids(n), extents, Padding::Neutral, 0)
            .with_iterations_between_swaps(iterations)
            .unwrap()
    }

    #[test]
    fn test_partition() {
        let d = dist(3, Extents::new(1, 0, 2, 0), 2);
        let shape = Shape::new(10, 3);

        let p = d.partition(0, shape);
        assert_eq!((p.owned_start, p.owned_rows, p.halo_before, p.halo_after), (0, 3, 0, 4));

        let p = d.partition(1, shape);
        assert_eq!((p.owned_start, p.owned_rows, p.halo_before, p.halo_after), (3, 3, 2, 4));
        assert_eq!(p.buffer_len(), 27);
        assert_eq!(p.owned_offset(), 6);

        let p = d.partition(2, shape);
        assert_eq!((p.owned_start, p.owned_rows, p.halo_before, p.halo_after), (6, 4, 2, 0));
    }

    #[test]
    fn test_max_iterations() {
        let shape = Shape::new(10, 1);
        assert_eq!(dist(1, Extents::uniform(3), 1).max_iterations_between_swaps(shape).unwrap(), usize::MAX);
        assert_eq!(dist(2, Extents::new(1, 0, 1, 0), 1).max_iterations_between_swaps(shape).unwrap(), 5);
        assert_eq!(dist(3, Extents::new(2, 0, 1, 0), 1).max_iterations_between_swaps(shape).unwrap(), 1);
        assert_eq!(dist(2, Extents::new(0, 4, 0, 4), 1).max_iterations_between_swaps(shape).unwrap(), usize::MAX);

        let err = dist(4, Extents::new(3, 0, 3, 0), 1)
            .max_iterations_between_swaps(shape)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DistributionError>(),
            Some(DistributionError::PartitionTooSmall { devices: 4, .. })
        ));

        assert!(StencilDist::new(&ids(1), Extents::default(), Padding::Nearest, 0u8)
            .with_iterations_between_swaps(0)
            .is_err());
    }

    #[test]
    fn test_round_trip() {
        let context = Context::host(3).unwrap();
        let shape = Shape::new(9, 2);
        let host = (0..18).collect_vec();
        let d = Distribution::Stencil(dist(3, Extents::new(1, 1, 1, 1), 2));

        let (buffers, output) = round_trip(&context, &d, shape, &host);
        assert_eq!(output, host);

        // Device 1 owns rows 3..6 and holds rows 1..8.
        assert_eq!(
            read_buffer::<i32>(&context, &buffers[&DeviceId(1)]),
            (2..16).collect_vec()
        );
    }

    #[test]
    fn test_swap() {
        let context = Context::host(2).unwrap();
        let devices = context.devices();
        let shape = Shape::new(6, 1);
        let d = dist(2, Extents::new(1, 0, 1, 0), 2);

        let host = (0..6).collect_vec();
        let (buffers, _) = round_trip(&context, &Distribution::Stencil(d.clone()), shape, &host);

        // Overwrite the owned rows on each device, leaving the halos stale.
        let _ = devices[DeviceId(0)]
            .enqueue_write(&buffers[&DeviceId(0)], 0, &[10, 11, 12])
            .unwrap();
        let _ = devices[DeviceId(1)]
            .enqueue_write(&buffers[&DeviceId(1)], 2, &[13, 14, 15])
            .unwrap();

        d.swap(devices, shape, &buffers).unwrap();

        assert_eq!(
            read_buffer::<i32>(&context, &buffers[&DeviceId(0)]),
            [10, 11, 12, 13, 14]
        );
        assert_eq!(
            read_buffer::<i32>(&context, &buffers[&DeviceId(1)]),
            [11, 12, 13, 14, 15]
        );
    }
}
