use std::marker::PhantomData;

use super::host::map_overlap_program;
use super::*;
use crate::container::{Matrix, Vector};
use crate::device::{EventSet, KernelArgs};
use crate::distribution::{OverlapDist, Padding};

/// Applies a function to the neighborhood of every element.
///
/// The input is distributed with an overlap of `radius` rows, so every device can read the
/// neighborhood of its own rows without communication. Elements outside the container are
/// replaced according to `padding`.
#[derive(Debug, Clone)]
pub struct MapOverlap<T, U> {
    program: Program,
    radius: usize,
    padding: Padding,
    neutral: T,
    phantom: PhantomData<fn(T) -> U>,
}

impl<T: Element, U: Element> MapOverlap<T, U> {
    pub fn new(program: Program, radius: usize, padding: Padding, neutral: T) -> Self {
        Self {
            program,
            radius,
            padding,
            neutral,
            phantom: PhantomData,
        }
    }

    /// MapOverlap running `fun` on the host backend.
    pub fn from_fn<F>(radius: usize, padding: Padding, neutral: T, fun: F) -> Self
    where
        F: Fn(&host::OverlapView<'_, '_>) -> U + Send + Sync + 'static,
    {
        Self::new(map_overlap_program(fun), radius, padding, neutral)
    }

    pub fn program(&self) -> &Program {
        &self.program
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

    fn distribution(&self, input: &dyn Container<T>) -> OverlapDist<T> {
        let block = match input.distribution() {
            Distribution::Block(block) => block,
            Distribution::Overlap(overlap) => overlap.block().clone(),
            _ => BlockDist::new(&devices_of(input.context(), input)),
        };

        OverlapDist::new(block, self.radius, self.padding, self.neutral)
    }

    pub fn start(
        &self,
        input: &dyn Container<T>,
        output: &dyn Container<U>,
        extra: KernelArgs,
    ) -> Result<EventSet> {
        check_not_aliased(input, output, "input and output of a map overlap")?;
        check_not_zero_sized(input)?;

        let context = input.context();
        let shape = input.shape();
        let overlap = self.distribution(input);
        let block = overlap.block().clone();

        input.set_distribution(Distribution::Overlap(overlap))?;
        input.copy_data_to_devices()?;
        output
            .data()
            .prepare_output(shape, Distribution::Block(block))?;

        let mut events = EventSet::new();
        for p in input.partitions() {
            if p.owned_len() == 0 {
                continue;
            }

            let device = device(context, p.device)?;
            let kernel = device.kernel(&self.program)?;
            let (global, local) = launch_2d(device, shape.columns, p.owned_rows);
            let args = KernelArgs::new()
                .buffer(&input.device_buffer(p.device))
                .buffer(&output.device_buffer(p.device))
                .value(p.owned_start as u64)
                .value(p.owned_rows as u64)
                .value(shape.columns as u64)
                .value(self.radius as u64)
                .value(self.padding.to_u32())
                .value(self.neutral)
                .extend(extra.clone());

            debug!(
                "map overlap {:?} over {} rows on device {}",
                self.program.name(),
                p.owned_rows,
                p.device
            );
            events.insert(device.enqueue(&kernel, global, local, NDRange::zero(), args)?);
        }

        output.data_on_device_modified();
        Ok(events)
    }

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
    use crate::container::ContainerError;

    fn box_blur(radius: isize) -> impl Fn(&host::OverlapView<'_, '_>) -> i32 + Send + Sync {
        move |view| {
            let mut sum = 0;
            for i in -radius..=radius {
                for j in -radius..=radius {
                    sum += view.get::<i32>(i, j);
                }
            }
            sum
        }
    }

    fn reference(data: &[i32], rows: usize, columns: usize, radius: isize, padding: Padding) -> Vec<i32> {
        let get = |r: isize, c: isize| {
            let inside = r >= 0 && r < rows as isize && c >= 0 && c < columns as isize;
            match padding {
                _ if inside => data[r as usize * columns + c as usize],
                Padding::Nearest => {
                    let r = r.clamp(0, rows as isize - 1) as usize;
                    let c = c.clamp(0, columns as isize - 1) as usize;
                    data[r * columns + c]
                }
                _ => 0,
            }
        };

        let mut output = vec![];
        for r in 0..rows as isize {
            for c in 0..columns as isize {
                let mut sum = 0;
                for i in -radius..=radius {
                    for j in -radius..=radius {
                        sum += get(r + i, c + j);
                    }
                }
                output.push(sum);
            }
        }
        output
    }

    #[test]
    fn test_blur_matrix() {
        for &devices in &[1, 2, 3] {
            for &padding in &[Padding::Nearest, Padding::Neutral] {
                let context = Context::host(devices).unwrap();
                let data = (0..42).map(|x| (x * 5 % 11) as i32).collect_vec();
                let input = Matrix::from_vec(&context, (7, 6), data.clone()).unwrap();

                let blur = MapOverlap::from_fn(1, padding, 0, box_blur(1));
                let output = blur.matrix(&input).unwrap();

                assert_eq!(
                    output.to_vec().unwrap(),
                    reference(&data, 7, 6, 1, padding),
                    "devices={} padding={:?}",
                    devices,
                    padding
                );
            }
        }
    }

    #[test]
    fn test_vector_neighbors() {
        let context = Context::host(2).unwrap();
        let input = Vector::from_vec(&context, vec![1.0f32, 2.0, 4.0, 8.0]);

        let diff = MapOverlap::from_fn(1, Padding::Neutral, 0.0f32, |view| {
            view.at::<f32>(1) - view.at::<f32>(-1)
        });
        let output = diff.vector(&input).unwrap();

        assert_eq!(output.to_vec().unwrap(), vec![2.0, 3.0, 6.0, -4.0]);
        assert_eq!(
            output.distribution(),
            Distribution::block(&context.devices().ids())
        );
        match input.distribution() {
            Distribution::Overlap(overlap) => assert_eq!(overlap.radius(), 1),
            other => panic!("unexpected distribution {:?}", other),
        }
    }

    #[test]
    fn test_position() {
        let context = Context::host(3).unwrap();
        let input = Matrix::filled(&context, (5, 2), 0u32);

        let index = MapOverlap::from_fn(0, Padding::Neutral, 0u32, |view| {
            (view.row() * 10 + view.column()) as u32
        });
        let output = index.matrix(&input).unwrap();

        assert_eq!(output.to_vec().unwrap(), vec![0, 1, 10, 11, 20, 21, 30, 31, 40, 41]);
    }

    #[test]
    fn test_aliased() {
        let context = Context::host(1).unwrap();
        let vector = Vector::from_vec(&context, vec![1, 2, 3]);

        let blur = MapOverlap::from_fn(1, Padding::Nearest, 0, box_blur(0));
        let err = blur.call(&vector, &vector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::Aliased(_))
        ));
    }

    #[test]
    fn test_zero_sized() {
        let context = Context::host(2).unwrap();
        let blur = MapOverlap::from_fn(1, Padding::Nearest, 0, box_blur(1));

        let empty = Vector::<i32>::from_vec(&context, vec![]);
        let err = blur.vector(&empty).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::ZeroSized(_))
        ));

        let flat = Matrix::filled(&context, (2, 0), 0i32);
        assert!(blur.matrix(&flat).is_err());
    }
}
