use std::marker::PhantomData;

use super::host::zip_program;
use super::*;
use crate::container::{ContainerError, Matrix, Vector};
use crate::device::{EventSet, KernelArgs};

/// Combines two containers of the same shape element by element.
///
/// The right input is redistributed to match the left input, and the output receives the
/// distribution of the left input.
#[derive(Debug, Clone)]
pub struct Zip<L, R, U> {
    program: Program,
    phantom: PhantomData<fn(L, R) -> U>,
}

impl<L: Element, R: Element, U: Element> Zip<L, R, U> {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phantom: PhantomData,
        }
    }

    /// Zip running `fun` on the host backend.
    pub fn from_fn<F>(fun: F) -> Self
    where
        F: Fn(L, R) -> U + Send + Sync + 'static,
    {
        Self::new(zip_program(fun))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn start(
        &self,
        left: &dyn Container<L>,
        right: &dyn Container<R>,
        output: &dyn Container<U>,
        extra: KernelArgs,
    ) -> Result<EventSet> {
        if left.shape() != right.shape() {
            return Err(ContainerError::ShapeMismatch {
                left: left.shape(),
                right: right.shape(),
            }
            .into());
        }

        let context = left.context();
        prepare_input(left)?;

        let distribution = left.distribution();
        let wanted = distribution.convert::<R>();
        if right.distribution() != wanted {
            right.set_distribution(wanted)?;
        }

        left.copy_data_to_devices()?;
        right.copy_data_to_devices()?;
        output
            .data()
            .prepare_output(left.shape(), distribution.convert())?;

        let mut events = EventSet::new();
        for p in left.partitions() {
            let n = p.buffer_len();
            if n == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            let kernel = device.kernel(&self.program)?;
            let (global, local) = launch_1d(context, device, n);
            let args = KernelArgs::new()
                .buffer(&left.device_buffer(p.device))
                .buffer(&right.device_buffer(p.device))
                .buffer(&output.device_buffer(p.device))
                .value(n as u64)
                .extend(extra.clone());

            debug!(
                "zip {:?} over {} elements on device {}",
                self.program.name(),
                n,
                p.device
            );
            events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);
        }

        output.data_on_device_modified();
        Ok(events)
    }

    pub fn call(
        &self,
        left: &dyn Container<L>,
        right: &dyn Container<R>,
        output: &dyn Container<U>,
    ) -> Result {
        self.call_with(left, right, output, KernelArgs::new())
    }

    pub fn call_with(
        &self,
        left: &dyn Container<L>,
        right: &dyn Container<R>,
        output: &dyn Container<U>,
        extra: KernelArgs,
    ) -> Result {
        self.start(left, right, output, extra)?.wait()
    }

    pub fn vector(&self, left: &Vector<L>, right: &Vector<R>) -> Result<Vector<U>> {
        let output = Vector::filled(left.context(), left.len(), U::default());
        self.call(left, right, &output)?;
        Ok(output)
    }

    pub fn matrix(&self, left: &Matrix<L>, right: &Matrix<R>) -> Result<Matrix<U>> {
        let output = Matrix::filled(left.context(), left.shape(), U::default());
        self.call(left, right, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_zip_vectors() {
        let context = Context::host(3).unwrap();
        let left = Vector::from_vec(&context, (0..64).collect::<Vec<i32>>());
        let right = Vector::from_vec(&context, (0..64).map(|x| x as f32 * 0.5).collect_vec());

        let add = Zip::from_fn(|l: i32, r: f32| l as f64 + r as f64);
        let output = add.vector(&left, &right).unwrap();

        assert_eq!(right.distribution(), left.distribution().convert::<f32>());
        assert_eq!(
            output.to_vec().unwrap(),
            (0..64).map(|x| x as f64 * 1.5).collect_vec()
        );
    }

    #[test]
    fn test_zip_redistributes_right() {
        let context = Context::host(2).unwrap();
        let ids = context.devices().ids();

        let left = Matrix::from_vec(&context, (3, 2), vec![1, 2, 3, 4, 5, 6]).unwrap();
        left.set_distribution(Distribution::single(ids[1])).unwrap();
        let right = Matrix::from_vec(&context, (3, 2), vec![10, 20, 30, 40, 50, 60]).unwrap();
        right.set_distribution(Distribution::block(&ids)).unwrap();
        right.copy_data_to_devices().unwrap();

        let output = Zip::from_fn(|l: i32, r: i32| r - l).matrix(&left, &right).unwrap();

        assert_eq!(right.distribution(), Distribution::single(ids[1]));
        assert_eq!(output.distribution(), Distribution::single(ids[1]));
        assert_eq!(output.row(2).unwrap(), vec![45, 54]);
    }

    #[test]
    fn test_zip_shape_mismatch() {
        let context = Context::host(1).unwrap();
        let left = Vector::from_vec(&context, vec![1, 2, 3]);
        let right = Vector::from_vec(&context, vec![1, 2]);

        let err = Zip::from_fn(|l: i32, r: i32| l + r)
            .vector(&left, &right)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_zip_same_input() {
        let context = Context::host(2).unwrap();
        let vector = Vector::from_vec(&context, vec![1, 2, 3, 4, 5]);

        let output = Zip::from_fn(|l: i32, r: i32| l * r)
            .vector(&vector, &vector)
            .unwrap();
        assert_eq!(output.to_vec().unwrap(), vec![1, 4, 9, 16, 25]);
    }
}
