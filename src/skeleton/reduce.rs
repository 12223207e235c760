use std::marker::PhantomData;

use super::host::reduce_program;
use super::*;
use crate::container::ContainerError;
use crate::device::{DeviceBuffer, EventSet, KernelArgs};

/// Combines all elements of a container into a single value using an associative operator.
///
/// Every device first reduces its own block. The partial results are then gathered on the
/// first device and reduced once more.
#[derive(Debug, Clone)]
pub struct Reduce<T> {
    program: Program,
    phantom: PhantomData<fn(T, T) -> T>,
}

impl<T: Element> Reduce<T> {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phantom: PhantomData,
        }
    }

    /// Reduce running `op` on the host backend.
    pub fn from_fn<F>(op: F) -> Self
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        Self::new(reduce_program(op))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Reduce `len` elements of `buffer` on `device` until one value is left. Returns the
    /// buffer which will hold this value once `events` have completed.
    fn reduce_on(
        &self,
        context: &Context,
        device: &Device,
        buffer: &DeviceBuffer,
        len: usize,
        events: &mut EventSet,
    ) -> Result<DeviceBuffer> {
        let wg = work_group_size(context, device);
        let kernel = device.kernel(&self.program)?;
        let mut src = buffer.clone();
        let mut len = len;

        loop {
            let chunk = max(2, div_ceil(len, wg));
            let items = div_ceil(len, chunk);
            let dst = device.create_buffer::<T>(items)?;
            let (global, local) = launch_1d(context, device, items);
            let args = KernelArgs::new()
                .buffer(&src)
                .buffer(&dst)
                .value(len as u64)
                .value(chunk as u64);

            trace!(
                "reduce {} elements into {} on device {}",
                len,
                items,
                device.id()
            );
            events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);

            src = dst;
            len = items;

            if len == 1 {
                break Ok(src);
            }
        }
    }

    pub fn call(&self, input: &dyn Container<T>) -> Result<T> {
        if input.is_empty() {
            return Err(ContainerError::Empty.into());
        }

        let context = input.context();
        prepare_blocks(input)?;
        input.copy_data_to_devices()?;

        let mut events = EventSet::new();
        let mut partials = vec![];
        for p in input.partitions() {
            if p.owned_len() == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            debug!(
                "reduce {:?} over {} elements on device {}",
                self.program.name(),
                p.owned_len(),
                p.device
            );

            let buffer = input.device_buffer(p.device);
            let result = self.reduce_on(context, device, &buffer, p.owned_len(), &mut events)?;
            partials.push(device.enqueue_read(&result, 0, 1)?);
        }

        events.wait()?;

        let mut values = vec![];
        for event in partials {
            values.extend(event.wait_vec::<T>()?);
        }

        if values.len() == 1 {
            return Ok(values[0]);
        }

        // Combine the partial results on the first device.
        let device = device(context, input.distribution().devices()[0])?;
        let buffer = device.create_buffer::<T>(values.len())?;
        let mut events = EventSet::from(device.enqueue_write(&buffer, 0, &values)?);
        let result = self.reduce_on(context, device, &buffer, values.len(), &mut events)?;
        let read = device.enqueue_read(&result, 0, 1)?;

        events.wait()?;
        Ok(read.wait_vec::<T>()?[0])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::{Matrix, Vector};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_sum() {
        let context = Context::host(3).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);

        for &n in &[1, 2, 3, 17, 1000, 5000] {
            let data = (0..n).map(|_| rng.gen_range(0..100)).collect::<Vec<u64>>();
            let vector = Vector::from_vec(&context, data.clone());

            let sum = Reduce::from_fn(|a: u64, b: u64| a + b);
            assert_eq!(sum.call(&vector).unwrap(), data.iter().sum::<u64>(), "n={}", n);
        }
    }

    #[test]
    fn test_order_preserved() {
        let context = Context::host(2).unwrap();

        // Concatenation of digits is associative but not commutative.
        let data = (1..=9).collect::<Vec<u64>>();
        let vector = Vector::from_vec(&context, data);
        let concat = Reduce::from_fn(|a: u64, b: u64| {
            let mut shift = 1;
            while shift <= b {
                shift *= 10;
            }
            a * shift + b
        });

        assert_eq!(concat.call(&vector).unwrap(), 123456789);
    }

    #[test]
    fn test_max_matrix() {
        let context = Context::host(2).unwrap();
        let ids = context.devices().ids();
        let matrix = Matrix::from_vec(&context, (4, 4), (0..16).map(|x| (x * 7 % 16) as i32).collect()).unwrap();
        matrix.set_distribution(Distribution::copy(&ids)).unwrap();

        let max = Reduce::from_fn(|a: i32, b: i32| std::cmp::max(a, b));
        assert_eq!(max.call(&matrix).unwrap(), 15);
        assert_eq!(matrix.distribution(), Distribution::block(&ids));
    }

    #[test]
    fn test_more_devices_than_elements() {
        let context = Context::host(4).unwrap();
        let vector = Vector::from_vec(&context, vec![5i64, -3]);

        let sum = Reduce::from_fn(|a: i64, b: i64| a + b);
        assert_eq!(sum.call(&vector).unwrap(), 2);
    }

    #[test]
    fn test_empty() {
        let context = Context::host(1).unwrap();
        let vector = Vector::<i32>::from_vec(&context, vec![]);

        let err = Reduce::from_fn(|a: i32, b: i32| a + b)
            .call(&vector)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::Empty)
        ));
    }
}
