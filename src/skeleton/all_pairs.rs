use std::marker::PhantomData;

use super::host::all_pairs_program;
use super::*;
use crate::container::{ContainerError, Matrix};
use crate::device::{EventSet, KernelArgs};
use crate::types::Shape;

/// Combines every row of a left matrix with every column of a right matrix.
///
/// For a left matrix of `n x d` elements and a right matrix of `d x m` elements, the output
/// has `n x m` elements. The rows of the left matrix and of the output are split among the
/// devices, while every device receives a full copy of the right matrix.
#[derive(Debug, Clone)]
pub struct AllPairs<T, U> {
    program: Program,
    phantom: PhantomData<fn(T, T) -> U>,
}

impl<T: Element, U: Element> AllPairs<T, U> {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            phantom: PhantomData,
        }
    }

    /// AllPairs running `fun` on the host backend. The function receives a row of the left
    /// matrix and a column of the right matrix.
    pub fn from_fn<F>(fun: F) -> Self
    where
        F: Fn(&[T], &[T]) -> U + Send + Sync + 'static,
    {
        Self::new(all_pairs_program(fun))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn start(
        &self,
        left: &Matrix<T>,
        right: &Matrix<T>,
        output: &Matrix<U>,
        extra: KernelArgs,
    ) -> Result<EventSet> {
        if left.columns() != right.rows() {
            return Err(ContainerError::ShapeMismatch {
                left: left.shape(),
                right: right.shape(),
            }
            .into());
        }

        check_not_aliased(left, right, "both inputs of all pairs")?;

        let context = left.context();
        let depth = left.columns();
        let columns = right.columns();

        let block = prepare_blocks(left)?;
        let wanted = Distribution::copy(block.devices());
        if right.distribution() != wanted {
            right.set_distribution(wanted)?;
        }

        left.copy_data_to_devices()?;
        right.copy_data_to_devices()?;
        output.data().prepare_output(
            Shape::new(left.rows(), columns),
            Distribution::Block(block),
        )?;

        let mut events = EventSet::new();
        for p in left.partitions() {
            if p.owned_rows == 0 || columns == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            let kernel = device.kernel(&self.program)?;
            let (global, local) = launch_2d(device, columns, p.owned_rows);
            let args = KernelArgs::new()
                .buffer(&left.device_buffer(p.device))
                .buffer(&right.device_buffer(p.device))
                .buffer(&output.device_buffer(p.device))
                .value(p.owned_rows as u64)
                .value(depth as u64)
                .value(columns as u64)
                .extend(extra.clone());

            debug!(
                "all pairs {:?} for {}x{} elements on device {}",
                self.program.name(),
                p.owned_rows,
                columns,
                p.device
            );
            events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);
        }

        output.data_on_device_modified();
        Ok(events)
    }

    pub fn call(&self, left: &Matrix<T>, right: &Matrix<T>, output: &Matrix<U>) -> Result {
        self.call_with(left, right, output, KernelArgs::new())
    }

    pub fn call_with(
        &self,
        left: &Matrix<T>,
        right: &Matrix<T>,
        output: &Matrix<U>,
        extra: KernelArgs,
    ) -> Result {
        self.start(left, right, output, extra)?.wait()
    }

    pub fn matrix(&self, left: &Matrix<T>, right: &Matrix<T>) -> Result<Matrix<U>> {
        let output = Matrix::filled(left.context(), (left.rows(), right.columns()), U::default());
        self.call(left, right, &output)?;
        Ok(output)
    }
}
