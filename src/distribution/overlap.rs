//! Internals for [`OverlapDist`].
use super::*;

/// Block distribution where every device additionally holds `radius` rows on either side of
/// its block. Halo rows between devices hold the neighbor's data, halo rows beyond the ends of
/// the container are filled according to the padding policy.
#[derive(Clone)]
pub struct OverlapDist<T> {
    pub(crate) block: BlockDist,
    radius: usize,
    padding: Padding,
    neutral: T,
}

impl<T: Element> OverlapDist<T> {
    pub fn new(block: BlockDist, radius: usize, padding: Padding, neutral: T) -> Self {
        Self {
            block,
            radius,
            padding,
            neutral,
        }
    }

    pub fn block(&self) -> &BlockDist {
        &self.block
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn neutral(&self) -> T {
        self.neutral
    }

    pub(crate) fn partition(&self, index: usize, shape: Shape) -> Partition {
        Partition {
            halo_before: self.radius,
            halo_after: self.radius,
            ..self.block.partition(index, shape)
        }
    }

    fn partitions(&self, shape: Shape) -> Vec<Partition> {
        (0..self.block.devices.len())
            .map(|i| self.partition(i, shape))
            .collect()
    }

    /// Values of the padding row that replaces global row `row`, which lies outside the
    /// container.
    fn padding_row(&self, host: &[T], shape: Shape, row: isize) -> Vec<T> {
        let columns = shape.columns;

        match self.padding {
            Padding::Nearest if shape.rows > 0 => {
                let nearest = if row < 0 { 0 } else { shape.rows - 1 };
                host[nearest * columns..(nearest + 1) * columns].to_vec()
            }
            _ => vec![self.neutral; columns],
        }
    }

    pub(crate) fn start_upload(
        &self,
        devices: &DeviceList,
        host: &[T],
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        let partitions = self.partitions(shape);
        let mut events = upload_rows(devices, &partitions, host, shape, buffers)?;

        for p in &partitions {
            let first = p.first_row();
            let end = (p.owned_end() + p.halo_after) as isize;
            let buffer = buffer_for(buffers, p.device)?;
            let device = &devices[p.device];

            // Padding before the first row of the container.
            let before = min(end, 0) - first;
            if before > 0 {
                let data = (0..before)
                    .flat_map(|i| self.padding_row(host, shape, first + i))
                    .collect_vec();
                events.insert(device.enqueue_write(buffer, 0, &data)?);
            }

            // Padding after the last row of the container.
            let start = max(first, shape.rows as isize);
            if start < end {
                let data = (start..end)
                    .flat_map(|row| self.padding_row(host, shape, row))
                    .collect_vec();
                let offset = (start - first) as usize * p.columns;
                events.insert(device.enqueue_write(buffer, offset, &data)?);
            }
        }

        Ok(events)
    }

    /// Downloads the owned rows. Afterwards the host copy is the only up-to-date copy.
    pub(crate) fn start_download(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        let mut plan = download_owned(devices, &self.partitions(shape), buffers)?;
        plan.mark_host_modified();
        Ok(plan)
    }

    pub(crate) fn convert<U: Element>(&self) -> OverlapDist<U> {
        OverlapDist {
            block: self.block.clone(),
            radius: self.radius,
            padding: self.padding,
            neutral: convert_neutral(&self.neutral),
        }
    }
}

impl<T: Element> PartialEq for OverlapDist<T> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
            && self.radius == other.radius
            && self.padding == other.padding
            && same_value(&self.neutral, &other.neutral)
    }
}

impl<T: Element> fmt::Debug for OverlapDist<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlapDist")
            .field("devices", &self.block.devices)
            .field("significances", &self.block.significances())
            .field("radius", &self.radius)
            .field("padding", &self.padding)
            .field("neutral", &self.neutral)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{ids, read_buffer, round_trip};
    use super::*;
    use crate::Context;

    #[test]
    fn test_nearest_vector() {
        let context = Context::host(2).unwrap();
        let host = (10..20).collect_vec();
        let shape = Shape::vector(host.len());
        let dist = Distribution::overlap(&ids(2), 2, Padding::Nearest, -1i32);

        assert_eq!(dist.size_for_device(DeviceId(0), shape), 9);
        assert_eq!(dist.size_for_device(DeviceId(1), shape), 9);

        let (buffers, output) = round_trip(&context, &dist, shape, &host);
        assert_eq!(output, host);

        assert_eq!(
            read_buffer::<i32>(&context, &buffers[&DeviceId(0)]),
            [10, 10, 10, 11, 12, 13, 14, 15, 16]
        );
        assert_eq!(
            read_buffer::<i32>(&context, &buffers[&DeviceId(1)]),
            [13, 14, 15, 16, 17, 18, 19, 19, 19]
        );
    }

    #[test]
    fn test_neutral_matrix() {
        let context = Context::host(3).unwrap();
        let shape = Shape::new(6, 2);
        let host = (0..12).map(|x| x as f32).collect_vec();
        let dist = Distribution::overlap(&ids(3), 1, Padding::Neutral, 0.5f32);

        let (buffers, output) = round_trip(&context, &dist, shape, &host);
        assert_eq!(output, host);

        assert_eq!(
            read_buffer::<f32>(&context, &buffers[&DeviceId(0)]),
            [0.5, 0.5, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        );
        assert_eq!(
            read_buffer::<f32>(&context, &buffers[&DeviceId(2)]),
            [6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 0.5, 0.5]
        );
    }

    #[test]
    fn test_radius_exceeds_partition() {
        // Device 1 owns a single row, so its halo reaches past both ends of the container.
        let context = Context::host(3).unwrap();
        let host = vec![1u8, 2, 3];
        let dist = Distribution::overlap(&ids(3), 2, Padding::Nearest, 0u8);

        let (buffers, output) = round_trip(&context, &dist, Shape::vector(3), &host);
        assert_eq!(output, host);
        assert_eq!(
            read_buffer::<u8>(&context, &buffers[&DeviceId(1)]),
            [1, 1, 2, 3, 3]
        );
    }

    #[test]
    fn test_download_marks_host() {
        let context = Context::host(1).unwrap();
        let dist = Distribution::overlap(&ids(1), 1, Padding::Neutral, 0u16);
        let shape = Shape::vector(1);
        let buffers: IndexMap<_, _> = vec![(
            DeviceId(0),
            context.devices()[DeviceId(0)].create_buffer::<u16>(3).unwrap(),
        )]
        .into_iter()
        .collect();

        let plan = dist
            .start_download(context.devices(), shape, &buffers)
            .unwrap();
        assert!(plan.marks_host_modified());
        plan.wait(&mut [0]).unwrap();
    }
}
