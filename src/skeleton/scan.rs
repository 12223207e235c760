use std::marker::PhantomData;

use super::host::scan_program;
use super::*;
use crate::container::Vector;
use crate::device::{EventSet, KernelArgs};

/// Inclusive prefix combination of all elements of a container using an associative operator.
///
/// The devices are processed in order of their blocks. Each device scans its own block and
/// passes its last value on to the next device, which combines it into its own results.
#[derive(Debug, Clone)]
pub struct Scan<T> {
    program: Program,
    phantom: PhantomData<fn(T, T) -> T>,
}

impl<T: Element> Scan<T> {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phantom: PhantomData,
        }
    }

    /// Scan running `op` on the host backend.
    pub fn from_fn<F>(op: F) -> Self
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        Self::new(scan_program(op))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn call(&self, input: &dyn Container<T>, output: &dyn Container<T>) -> Result {
        let context = input.context();
        let block = prepare_blocks(input)?;
        input.copy_data_to_devices()?;
        output
            .data()
            .prepare_output(input.shape(), Distribution::Block(block))?;

        let mut events = EventSet::new();
        let mut carry: Option<T> = None;

        for p in input.partitions() {
            let n = p.owned_len();
            if n == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            let kernel = device.kernel(&self.program)?;
            let chunk = div_ceil(n, work_group_size(context, device));
            let items = div_ceil(n, chunk);
            let sums = device.create_buffer::<T>(items)?;

            debug!(
                "scan {:?} over {} elements on device {} in {} chunks",
                self.program.name(),
                n,
                p.device,
                items
            );

            for phase in 0..3u32 {
                let (global, local) = if phase == 1 {
                    (NDRange::d1(1), NDRange::d1(1))
                } else {
                    launch_1d(context, device, items)
                };

                let args = KernelArgs::new()
                    .buffer(&input.device_buffer(p.device))
                    .buffer(&output.device_buffer(p.device))
                    .buffer(&sums)
                    .value(n as u64)
                    .value(chunk as u64)
                    .value(phase)
                    .value(carry.unwrap_or_default())
                    .value(carry.is_some() as u32);

                events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);
            }

            // The next device needs the total of everything before it.
            let last = device.enqueue_read(&sums, items - 1, 1)?.wait_vec::<T>()?;
            carry = Some(last[0]);
        }

        events.wait()?;
        output.data_on_device_modified();
        Ok(())
    }

    pub fn vector(&self, input: &Vector<T>) -> Result<Vector<T>> {
        let output = Vector::filled(input.context(), input.len(), T::default());
        self.call(input, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::Matrix;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn prefix_sums(data: &[i64]) -> Vec<i64> {
        data.iter()
            .scan(0, |acc, x| {
                *acc += x;
                Some(*acc)
            })
            .collect()
    }

    #[test]
    fn test_prefix_sum() {
        let mut rng = SmallRng::seed_from_u64(3);

        for &devices in &[1, 2, 3] {
            let context = Context::host(devices).unwrap();

            for &n in &[1, 2, 7, 256, 1000, 4099] {
                let data = (0..n).map(|_| rng.gen_range(-50..50)).collect::<Vec<i64>>();
                let input = Vector::from_vec(&context, data.clone());

                let output = Scan::from_fn(|a: i64, b: i64| a + b).vector(&input).unwrap();
                assert_eq!(
                    output.to_vec().unwrap(),
                    prefix_sums(&data),
                    "devices={} n={}",
                    devices,
                    n
                );
            }
        }
    }

    #[test]
    fn test_scan_matrix_in_place() {
        let context = Context::host(2).unwrap();
        let matrix = Matrix::from_vec(&context, (3, 2), vec![1i64; 6]).unwrap();

        Scan::from_fn(|a: i64, b: i64| a + b)
            .call(&matrix, &matrix)
            .unwrap();

        assert_eq!(matrix.to_vec().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_scan_not_commutative() {
        let context = Context::host(3).unwrap();
        let input = Vector::from_vec(&context, vec![[1u32, 0], [2, 1], [3, 2], [4, 3], [5, 4]]);

        // Composition of affine maps x -> a * x + b, applied left to right.
        let compose = Scan::from_fn(|f: [u32; 2], g: [u32; 2]| [f[0] * g[0], g[0] * f[1] + g[1]]);
        let output = compose.vector(&input).unwrap().to_vec().unwrap();

        assert_eq!(output[0], [1, 0]);
        assert_eq!(output[1], [2, 1]);
        assert_eq!(output[2], [6, 5]);
        assert_eq!(output[3], [24, 23]);
        assert_eq!(output[4], [120, 119]);
    }

    #[test]
    fn test_scan_empty() {
        let context = Context::host(2).unwrap();
        let input = Vector::<i64>::from_vec(&context, vec![]);

        let output = Scan::from_fn(|a: i64, b: i64| a + b).vector(&input).unwrap();
        assert!(output.to_vec().unwrap().is_empty());
    }
}
