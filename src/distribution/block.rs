//! Internals for [`BlockDist`].
use super::*;

/// Splits `rows` into one contiguous block per significance. Every device except the last
/// receives `round(rows * significance)` rows (limited to what is left), the last device
/// receives the remainder so that no row is lost to rounding.
pub fn block_rows(rows: usize, significances: &[f64]) -> Vec<usize> {
    let mut result = Vec::with_capacity(significances.len());
    let mut remaining = rows;

    for (i, &s) in enumerate(significances) {
        let n = if i + 1 == significances.len() {
            remaining
        } else {
            min((rows as f64 * s).round() as usize, remaining)
        };

        remaining -= n;
        result.push(n);
    }

    result
}

/// Distributes the rows among the devices in contiguous blocks, weighted by a per-device
/// significance.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockDist {
    pub(crate) devices: Vec<DeviceId>,
    significances: Vec<f64>,
}

impl BlockDist {
    pub fn new(devices: &[DeviceId]) -> Self {
        let n = devices.len();

        Self {
            devices: devices.to_vec(),
            significances: vec![1.0 / n as f64; n],
        }
    }

    pub fn with_significances(devices: &[DeviceId], significances: &[f64]) -> Result<Self> {
        let sum: f64 = significances.iter().sum();

        if significances.len() != devices.len()
            || significances.is_empty()
            || significances.iter().any(|&s| !(s >= 0.0))
            || (sum - 1.0).abs() > 1e-6
        {
            return Err(DistributionError::InvalidSignificances(significances.to_vec()).into());
        }

        Ok(Self {
            devices: devices.to_vec(),
            significances: significances.to_vec(),
        })
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn significances(&self) -> &[f64] {
        &self.significances
    }

    pub(crate) fn rows(&self, rows: usize) -> Vec<usize> {
        block_rows(rows, &self.significances)
    }

    pub(crate) fn owned(&self, index: usize, rows: usize) -> (usize, usize) {
        let sizes = self.rows(rows);
        let start = sizes[..index].iter().sum();
        (start, sizes[index])
    }

    pub(crate) fn partition(&self, index: usize, shape: Shape) -> Partition {
        let (owned_start, owned_rows) = self.owned(index, shape.rows);

        Partition {
            device: self.devices[index],
            owned_start,
            owned_rows,
            halo_before: 0,
            halo_after: 0,
            columns: shape.columns,
        }
    }

    pub(crate) fn partitions(&self, shape: Shape) -> Vec<Partition> {
        (0..self.devices.len())
            .map(|i| self.partition(i, shape))
            .collect()
    }

    pub(crate) fn start_upload<T: Element>(
        &self,
        devices: &DeviceList,
        host: &[T],
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<EventSet> {
        upload_rows(devices, &self.partitions(shape), host, shape, buffers)
    }

    pub(crate) fn start_download<T: Element>(
        &self,
        devices: &DeviceList,
        shape: Shape,
        buffers: &IndexMap<DeviceId, DeviceBuffer>,
    ) -> Result<DownloadPlan<T>> {
        download_owned(devices, &self.partitions(shape), buffers)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{ids, read_buffer, round_trip};
    use super::*;
    use crate::Context;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_block_rows() {
        assert_eq!(block_rows(8, &[0.5, 0.5]), [4, 4]);
        assert_eq!(block_rows(10, &[1.0 / 3.0; 3]), [3, 3, 4]);
        assert_eq!(block_rows(2, &[0.25; 4]), [1, 1, 0, 0]);
        assert_eq!(block_rows(0, &[0.5, 0.5]), [0, 0]);
        assert_eq!(block_rows(7, &[1.0]), [7]);
    }

    #[test]
    fn test_partition_completeness() {
        let mut rng = SmallRng::seed_from_u64(0);

        for _ in 0..1000 {
            let rows = rng.gen_range(0..10_000);
            let n = rng.gen_range(1..9);

            let weights: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0) + 1e-3).collect();
            let total: f64 = weights.iter().sum();
            let significances = weights.iter().map(|w| w / total).collect_vec();

            let dist = BlockDist::with_significances(&ids(n), &significances).unwrap();
            let parts = dist.partitions(Shape::vector(rows));

            assert_eq!(parts.iter().map(|p| p.owned_rows).sum::<usize>(), rows);

            let mut next = 0;
            for p in &parts {
                assert_eq!(p.owned_start, next);
                assert_eq!(p.buffer_len(), p.owned_rows);
                next = p.owned_end();
            }
        }
    }

    #[test]
    fn test_invalid_significances() {
        assert!(BlockDist::with_significances(&ids(2), &[0.5, 0.6]).is_err());
        assert!(BlockDist::with_significances(&ids(2), &[1.5, -0.5]).is_err());
        assert!(BlockDist::with_significances(&ids(2), &[1.0]).is_err());
        assert!(BlockDist::with_significances(&[], &[]).is_err());
        assert!(BlockDist::with_significances(&ids(2), &[f64::NAN, 1.0]).is_err());
        assert!(BlockDist::with_significances(&ids(2), &[0.0, 1.0]).is_ok());
    }

    #[test]
    fn test_matrix_8x4() {
        let context = Context::host(2).unwrap();
        let dist = Distribution::<i32>::block(&ids(2));
        let shape = Shape::new(8, 4);

        assert_eq!(dist.partition(0, shape).owned_rows, 4);
        assert_eq!(dist.partition(1, shape).owned_rows, 4);
        assert_eq!(dist.size_for_device(DeviceId(0), shape), 16);
        assert_eq!(dist.size_for_device(DeviceId(1), shape), 16);

        let host = (0..32).collect_vec();
        let (buffers, output) = round_trip(&context, &dist, shape, &host);
        assert_eq!(output, host);
        assert_eq!(read_buffer::<i32>(&context, &buffers[1]), (16..32).collect_vec());
    }

    #[test]
    fn test_round_trip() {
        let context = Context::host(3).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);

        for &len in &[1, 2, 3, 7, 100] {
            let host: Vec<f32> = (0..len).map(|_| rng.gen()).collect();
            let dist = Distribution::block_with_significances(&ids(3), &[0.2, 0.5, 0.3]).unwrap();

            let (_, output) = round_trip(&context, &dist, Shape::vector(len), &host);
            assert_eq!(output, host);
        }
    }
}
