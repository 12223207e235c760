use std::marker::PhantomData;

use super::host::map_program;
use super::*;
use crate::container::{Matrix, Vector};
use crate::device::{EventSet, KernelArgs};

/// Applies a function to every element of a container.
///
/// The output receives the distribution of the input, so the result of a map stays on the
/// devices that computed it.
#[derive(Debug, Clone)]
pub struct Map<T, U> {
    program: Program,
    phantom: PhantomData<fn(T) -> U>,
}

impl<T: Element, U: Element> Map<T, U> {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phantom: PhantomData,
        }
    }

    /// Map running `fun` on the host backend.
    pub fn from_fn<F>(fun: F) -> Self
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Self::new(map_program(fun))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Launch the map on all devices of the input without waiting for it to finish.
    pub fn start(
        &self,
        input: &dyn Container<T>,
        output: &dyn Container<U>,
        extra: KernelArgs,
    ) -> Result<EventSet> {
        let context = input.context();
        prepare_input(input)?;
        input.copy_data_to_devices()?;

        let distribution = input.distribution();
        output.data().prepare_output(input.shape(), distribution.convert())?;

        let mut events = EventSet::new();
        for p in input.partitions() {
            let n = p.buffer_len();
            if n == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            let kernel = device.kernel(&self.program)?;
            let (global, local) = launch_1d(context, device, n);
            let args = KernelArgs::new()
                .buffer(&input.device_buffer(p.device))
                .buffer(&output.device_buffer(p.device))
                .value(n as u64)
                .extend(extra.clone());

            debug!(
                "map {:?} over {} elements on device {}",
                self.program.name(),
                n,
                p.device
            );
            events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);
        }

        output.data_on_device_modified();
        Ok(events)
    }

    /// Map `input` into `output`, which is resized to the shape of the input.
    pub fn call(&self, input: &dyn Container<T>, output: &dyn Container<U>) -> Result {
        self.call_with(input, output, KernelArgs::new())
    }

    pub fn call_with(
        &self,
        input: &dyn Container<T>,
        output: &dyn Container<U>,
        extra: KernelArgs,
    ) -> Result {
        self.start(input, output, extra)?.wait()
    }

    pub fn vector(&self, input: &Vector<T>) -> Result<Vector<U>> {
        let output = Vector::filled(input.context(), input.len(), U::default());
        self.call(input, &output)?;
        Ok(output)
    }

    pub fn matrix(&self, input: &Matrix<T>) -> Result<Matrix<U>> {
        let output = Matrix::filled(input.context(), input.shape(), U::default());
        self.call(input, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::{Matrix, Vector};
    use crate::distribution::{DistributionError, Padding};
    use crate::types::Shape;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_map_vector() {
        let context = Context::host(3).unwrap();
        let input = Vector::from_vec(&context, (0..100).collect::<Vec<i32>>());

        let square = Map::from_fn(|x: i32| (x * x) as i64);
        let output = square.vector(&input).unwrap();

        assert_eq!(output.distribution(), Distribution::block(&context.devices().ids()));
        assert!(!output.host_up_to_date());
        assert_eq!(
            output.to_vec().unwrap(),
            (0..100).map(|x| (x * x) as i64).collect_vec()
        );
    }

    #[test]
    fn test_map_keeps_distribution() {
        let context = Context::host(2).unwrap();
        let ids = context.devices().ids();
        let input = Matrix::from_vec(&context, (4, 3), (0..12).map(|x| x as f32).collect()).unwrap();
        input
            .set_distribution(Distribution::copy_with_combine(&ids, |a, _| a))
            .unwrap();

        // Same element type: the combine function is kept.
        let output = Matrix::filled(&context, (1, 1), 0.0f32);
        Map::from_fn(|x: f32| x / 2.0).call(&input, &output).unwrap();

        assert_eq!(output.shape(), Shape::new(4, 3));
        assert_eq!(output.distribution(), input.distribution());
        assert_eq!(output.get(3, 2).unwrap(), 5.5);

        // Other element type: the combine function is lost.
        let output = Map::from_fn(|x: f32| x as f64).matrix(&input).unwrap();
        assert_eq!(output.distribution(), Distribution::copy(&ids));

        let err = output.to_vec().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DistributionError>(),
            Some(DistributionError::MissingCombineFunction(2))
        ));
    }

    #[test]
    fn test_map_overlap_input() {
        let context = Context::host(2).unwrap();
        let ids = context.devices().ids();
        let input = Vector::from_vec(&context, vec![1u32, 2, 3, 4, 5]);
        input
            .set_distribution(Distribution::overlap(&ids, 1, Padding::Neutral, 0))
            .unwrap();

        let output = Map::from_fn(|x: u32| x + 1).vector(&input).unwrap();
        assert_eq!(output.to_vec().unwrap(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_map_extra_args() {
        let context = Context::host(2).unwrap();
        let input = Vector::from_vec(&context, vec![1.0f32; 10]);
        let output = Vector::filled(&context, 10, 0.0f32);

        let scale = Map::new(host::map_program_with(|x: f32, extra| {
            x * extra.value::<f32>(0)
        }));
        scale
            .call_with(&input, &output, KernelArgs::new().value(2.5f32))
            .unwrap();

        assert_eq!(output.to_vec().unwrap(), vec![2.5; 10]);
    }

    #[test]
    fn test_map_in_place() {
        let context = Context::host(2).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let data = (0..50).map(|_| rng.gen_range(0..1000)).collect::<Vec<i32>>();
        let vector = Vector::from_vec(&context, data.clone());

        let negate = Map::from_fn(|x: i32| -x);
        negate.call(&vector, &vector).unwrap();

        assert_eq!(vector.to_vec().unwrap(), data.iter().map(|x| -x).collect_vec());
    }

    #[test]
    fn test_map_empty() {
        let context = Context::host(2).unwrap();
        let input = Vector::<i32>::from_vec(&context, vec![]);

        let output = Map::from_fn(|x: i32| x).vector(&input).unwrap();
        assert!(output.is_empty());
        assert_eq!(output.to_vec().unwrap(), Vec::<i32>::new());
    }
}
