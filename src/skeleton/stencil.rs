use super::host::stencil_program;
use super::*;
use crate::container::Matrix;
use crate::device::{DeviceBuffer, Event, EventSet, KernelArgs};
use crate::distribution::{Extents, Padding, Partition, StencilDist};
use crate::types::Shape;

/// One step of a [`Stencil`]: a program together with the neighborhood it reads and the way
/// elements outside the container are replaced.
#[derive(Debug, Clone)]
pub struct StencilShape<T> {
    program: Program,
    extents: Extents,
    padding: Padding,
    neutral: T,
}

impl<T: Element> StencilShape<T> {
    pub fn new(program: Program, extents: Extents, padding: Padding, neutral: T) -> Self {
        Self {
            program,
            extents,
            padding,
            neutral,
        }
    }

    /// Shape running `fun` on the host backend.
    pub fn from_fn<F>(extents: Extents, padding: Padding, neutral: T, fun: F) -> Self
    where
        F: Fn(&host::StencilView<'_, '_>) -> T + Send + Sync + 'static,
    {
        Self::new(stencil_program(fun), extents, padding, neutral)
    }

    pub fn program(&self) -> &Program {
        &self.program
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
}

/// Iterative stencil computation. Every iteration applies all shapes in the order they were
/// added, and every shape reads the result of the previous one.
///
/// On multiple devices, every device holds enough halo rows of its neighbors to run
/// `iterations_between_swaps` iterations on its own. The halo rows are recomputed locally, so
/// the result does not depend on the number of devices or on the swap interval. Larger
/// intervals trade redundant computation for fewer swaps.
#[derive(Debug, Clone)]
pub struct Stencil<T> {
    shapes: Vec<StencilShape<T>>,
    iterations_between_swaps: Option<usize>,
}

/// Buffers used by a single step of the computation on every device.
struct Step<'a> {
    src: &'a IndexMap<DeviceId, DeviceBuffer>,
    dst: &'a IndexMap<DeviceId, DeviceBuffer>,
    initial: &'a IndexMap<DeviceId, DeviceBuffer>,
}

impl<T: Element> Stencil<T> {
    pub fn new(shape: StencilShape<T>) -> Self {
        Self {
            shapes: vec![shape],
            iterations_between_swaps: None,
        }
    }

    /// Append a shape, which is applied after all existing shapes in every iteration.
    pub fn add(&mut self, shape: StencilShape<T>) -> &mut Self {
        self.shapes.push(shape);
        self
    }

    pub fn shapes(&self) -> &[StencilShape<T>] {
        &self.shapes
    }

    /// Neighborhood read by one full iteration.
    pub fn extents(&self) -> Extents {
        self.shapes
            .iter()
            .fold(Extents::default(), |acc, shape| acc + shape.extents)
    }

    /// Number of iterations between two halo swaps. If not set, the value from the
    /// configuration is used, or one if the configuration does not specify it either.
    pub fn set_iterations_between_swaps(&mut self, iterations: Option<usize>) -> &mut Self {
        self.iterations_between_swaps = iterations;
        self
    }

    pub fn iterations_between_swaps(&self) -> Option<usize> {
        self.iterations_between_swaps
    }

    fn distribution(
        &self,
        context: &Context,
        input: &dyn Container<T>,
        iterations: usize,
    ) -> Result<StencilDist<T>> {
        let shape = input.shape();
        let first = &self.shapes[0];
        let available = devices_of(context, input);
        let mut devices = available.clone();
        let mut dist = StencilDist::new(&devices, self.extents(), first.padding, first.neutral);

        // Drop devices until every partition can hold the halos of its neighbors.
        let mut limit = None;
        while devices.len() > 1 {
            match dist.max_iterations_between_swaps(shape) {
                Ok(l) => {
                    limit = Some(l);
                    break;
                }
                Err(_) => {
                    devices.pop();
                    dist = StencilDist::new(&devices, self.extents(), first.padding, first.neutral);
                }
            }
        }

        if devices.len() < available.len() {
            warn!(
                "{:?} is too small for halos of {:?} on {} devices, using {} devices",
                shape,
                self.extents(),
                available.len(),
                devices.len()
            );
        }

        let requested = self
            .iterations_between_swaps
            .or(context.config().skeleton.iterations_between_swaps)
            .unwrap_or(1);
        let mut s = max(1, min(requested, iterations));

        if let Some(limit) = limit {
            if s > limit {
                warn!(
                    "reducing iterations between swaps from {} to {} for {:?} on {} devices",
                    s,
                    limit,
                    shape,
                    devices.len()
                );
                s = limit;
            }
        }

        dist.with_iterations_between_swaps(s)
    }

    /// Apply the stencil `iterations` times to `input` and store the result in `output`.
    /// The intermediate results are stored alternately in `output` and `temp`.
    pub fn call(
        &self,
        iterations: usize,
        input: &dyn Container<T>,
        temp: &dyn Container<T>,
        output: &dyn Container<T>,
    ) -> Result {
        self.call_with(iterations, input, temp, output, KernelArgs::new())
    }

    pub fn call_with(
        &self,
        iterations: usize,
        input: &dyn Container<T>,
        temp: &dyn Container<T>,
        output: &dyn Container<T>,
        extra: KernelArgs,
    ) -> Result {
        ensure!(iterations > 0, "a stencil needs at least one iteration");
        check_not_zero_sized(input)?;

        let steps = iterations * self.shapes.len();
        check_not_aliased(input, output, "input and output of a stencil")?;
        if steps > 1 {
            check_not_aliased(input, temp, "input and temporary of a stencil")?;
            check_not_aliased(temp, output, "temporary and output of a stencil")?;
        }

        let context = input.context();
        let shape = input.shape();
        let dist = self.distribution(context, input, iterations)?;
        let s = dist.iterations_between_swaps();

        input.set_distribution(Distribution::Stencil(dist.clone()))?;
        input.copy_data_to_devices()?;
        output
            .data()
            .prepare_output(shape, Distribution::Stencil(dist.clone()))?;
        if steps > 1 {
            temp.data()
                .prepare_output(shape, Distribution::Stencil(dist.clone()))?;
        }

        debug!(
            "stencil with {} shapes for {} iterations over {:?} on {} devices, swapping every {} iterations",
            self.shapes.len(),
            iterations,
            shape,
            dist.devices().len(),
            s
        );

        let initial = input.data().device_buffers();
        let buffers = [
            output.data().device_buffers(),
            if steps > 1 {
                temp.data().device_buffers()
            } else {
                default()
            },
        ];

        let partitions = input.partitions();
        let total = self.extents();
        let mut events = EventSet::new();
        let mut step = 0;
        let mut remaining = iterations;

        while remaining > 0 {
            let segment = min(s, remaining);
            let mut consumed = Extents::default();

            for _ in 0..segment {
                for shape_info in &self.shapes {
                    consumed = consumed + shape_info.extents;

                    // The last step always writes into the output.
                    let dst = &buffers[(steps - 1 - step) % 2];
                    let src = if step == 0 {
                        &initial
                    } else {
                        &buffers[(steps - step) % 2]
                    };

                    let step_buffers = Step {
                        src,
                        dst,
                        initial: &initial,
                    };

                    for p in &partitions {
                        let top = min(p.halo_before, segment * total.north - consumed.north);
                        let bottom = min(p.halo_after, segment * total.south - consumed.south);
                        let rows = p.owned_rows + top + bottom;
                        if rows == 0 || shape.columns == 0 {
                            continue;
                        }

                        let range = (p.owned_start - top, rows);
                        events.insert(self.launch(
                            context,
                            shape_info,
                            p,
                            shape,
                            range,
                            &step_buffers,
                            &extra,
                        )?);
                    }

                    step += 1;
                }
            }

            remaining -= segment;

            if remaining > 0 && partitions.len() > 1 {
                let last = &buffers[(steps - step) % 2];
                dist.swap(context.devices(), shape, last)?;
            }
        }

        events.wait()?;

        output.data_on_device_modified();
        if steps > 1 {
            temp.data_on_device_modified();
        }

        Ok(())
    }

    fn launch(
        &self,
        context: &Context,
        shape_info: &StencilShape<T>,
        p: &Partition,
        shape: Shape,
        (first_row, rows): (usize, usize),
        buffers: &Step<'_>,
        extra: &KernelArgs,
    ) -> Result<Event> {
        let device = device(context, p.device)?;
        let kernel = device.kernel(&shape_info.program)?;
        let (global, local) = launch_2d(device, shape.columns, rows);
        let extents = shape_info.extents;
        let scratch = (local.x + extents.west + extents.east)
            * (local.y + extents.north + extents.south)
            * T::size_in_bytes();

        let args = KernelArgs::new()
            .buffer(&buffers.src[&p.device])
            .buffer(&buffers.dst[&p.device])
            .buffer(&buffers.initial[&p.device])
            .value(p.first_row() as u64)
            .value(p.buffer_rows() as u64)
            .value(first_row as u64)
            .value(rows as u64)
            .value(shape.rows as u64)
            .value(shape.columns as u64)
            .value(extents.north as u64)
            .value(extents.west as u64)
            .value(extents.south as u64)
            .value(extents.east as u64)
            .value(shape_info.padding.to_u32())
            .value(shape_info.neutral)
            .local(scratch)
            .extend(extra.clone());

        trace!(
            "stencil {:?} on rows {}..{} of device {}",
            shape_info.program.name(),
            first_row,
            first_row + rows,
            p.device
        );
        device.enqueue(&kernel, global, local, NDRange::zero(), args)
    }

    /// Apply the stencil `iterations` times to `input`, returning the result as a new matrix.
    pub fn matrix(&self, iterations: usize, input: &Matrix<T>) -> Result<Matrix<T>> {
        let context = input.context();
        let output = Matrix::filled(context, input.shape(), T::default());
        let temp = Matrix::filled(context, input.shape(), T::default());

        self.call(iterations, input, &temp, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::{ContainerError, Vector};
    use crate::types::Config;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    /// Sum of the four direct neighbors and the center.
    fn cross() -> StencilShape<i64> {
        StencilShape::from_fn(Extents::uniform(1), Padding::Nearest, 0, |view| {
            view.get::<i64>(-1, 0)
                + view.get::<i64>(1, 0)
                + view.get::<i64>(0, -1)
                + view.get::<i64>(0, 1)
                + view.center::<i64>()
        })
    }

    /// Difference between the two rows below and the row above, modulo a prime.
    fn skewed(padding: Padding) -> StencilShape<i64> {
        StencilShape::from_fn(Extents::new(1, 0, 2, 1), padding, 7, |view| {
            (view.get::<i64>(2, 0) * 3 + view.get::<i64>(1, 1) - view.get::<i64>(-1, 0) + 1000)
                % 997
        })
    }

    fn context(devices: usize) -> Context {
        Context::new(Config::host(devices)).unwrap()
    }

    fn run(
        stencil: &Stencil<i64>,
        devices: usize,
        iterations: usize,
        shape: Shape,
        data: &[i64],
    ) -> Vec<i64> {
        let context = context(devices);
        let input = Matrix::from_vec(&context, shape, data.to_vec()).unwrap();
        let output = stencil.matrix(iterations, &input).unwrap();
        output.to_vec().unwrap()
    }

    type RefFn = fn(&dyn Fn(isize, isize) -> i64) -> i64;

    /// Straightforward evaluation on the host.
    fn reference(
        shapes: &[(Padding, i64, RefFn)],
        iterations: usize,
        shape: Shape,
        data: &[i64],
    ) -> Vec<i64> {
        let (rows, columns) = (shape.rows as isize, shape.columns as isize);
        let mut current = data.to_vec();

        for _ in 0..iterations {
            for &(padding, neutral, fun) in shapes {
                let src = current.clone();
                for r in 0..rows {
                    for c in 0..columns {
                        let get = |dr: isize, dc: isize| {
                            let (row, col) = (r + dr, c + dc);
                            let inside = row >= 0 && row < rows && col >= 0 && col < columns;
                            let clamped = (row.clamp(0, rows - 1) * columns
                                + col.clamp(0, columns - 1))
                                as usize;
                            match padding {
                                _ if inside => src[clamped],
                                Padding::Neutral => neutral,
                                Padding::Nearest => src[clamped],
                                Padding::NearestInitial => data[clamped],
                            }
                        };
                        current[(r * columns + c) as usize] = fun(&get);
                    }
                }
            }
        }

        current
    }

    fn cross_ref(get: &dyn Fn(isize, isize) -> i64) -> i64 {
        get(-1, 0) + get(1, 0) + get(0, -1) + get(0, 1) + get(0, 0)
    }

    fn skewed_ref(get: &dyn Fn(isize, isize) -> i64) -> i64 {
        (get(2, 0) * 3 + get(1, 1) - get(-1, 0) + 1000) % 997
    }

    #[test]
    fn test_identity() {
        let context = context(2);
        let input = Vector::from_vec(&context, vec![1.0f32, 2.0, 3.0, 4.0, 5.0]);
        let temp = Vector::filled(&context, 5, 0.0f32);
        let output = Vector::filled(&context, 5, 0.0f32);

        let identity = Stencil::new(StencilShape::from_fn(
            Extents::new(1, 0, 1, 0),
            Padding::Neutral,
            0.0f32,
            |view| view.center::<f32>(),
        ));
        identity.call(3, &input, &temp, &output).unwrap();

        assert_eq!(output.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(input.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    fn identity_rows() -> Stencil<i64> {
        Stencil::new(StencilShape::from_fn(
            Extents::new(1, 0, 1, 0),
            Padding::Nearest,
            0,
            |view| view.center::<i64>(),
        ))
    }

    #[test]
    fn test_identity_single_device() {
        let context = context(1);
        let data = (0..15).collect::<Vec<i64>>();
        let input = Matrix::from_vec(&context, (5, 3), data.clone()).unwrap();
        let temp = Matrix::filled(&context, (5, 3), 0i64);
        let output = Matrix::filled(&context, (5, 3), 0i64);

        identity_rows().call(3, &input, &temp, &output).unwrap();

        assert_eq!(output.to_vec().unwrap(), data);
        assert_eq!(input.to_vec().unwrap(), data);
    }

    #[test]
    fn test_fewer_rows_than_devices() {
        let context = context(4);
        let data = (0..6).collect::<Vec<i64>>();
        let input = Matrix::from_vec(&context, (3, 2), data.clone()).unwrap();

        let output = identity_rows().matrix(1, &input).unwrap();
        assert_eq!(output.to_vec().unwrap(), data);

        match input.distribution() {
            Distribution::Stencil(dist) => assert_eq!(dist.devices().len(), 3),
            other => panic!("unexpected distribution {:?}", other),
        }

        let input = Matrix::from_vec(&context, (1, 2), vec![4i64, 5]).unwrap();
        let output = Stencil::new(cross()).matrix(2, &input).unwrap();
        let expected = reference(
            &[(Padding::Nearest, 0, cross_ref as RefFn)],
            2,
            Shape::new(1, 2),
            &[4, 5],
        );
        assert_eq!(output.to_vec().unwrap(), expected);
    }

    #[test]
    fn test_matches_reference() {
        let shape = Shape::new(9, 4);
        let data = (0..36).map(|x| (x * 13 % 17) as i64).collect_vec();
        let stencil = Stencil::new(cross());

        let expected = reference(
            &[(Padding::Nearest, 0, cross_ref as RefFn)],
            4,
            shape,
            &data,
        );
        assert_eq!(run(&stencil, 1, 4, shape, &data), expected);
    }

    #[test]
    fn test_independent_of_devices_and_swaps() {
        let mut rng = SmallRng::seed_from_u64(5);
        let shape = Shape::new(24, 5);
        let data = (0..shape.len()).map(|_| rng.gen_range(0..100)).collect_vec();

        for &padding in &[Padding::Nearest, Padding::Neutral, Padding::NearestInitial] {
            let mut stencil = Stencil::new(cross());
            stencil.add(skewed(padding));

            let iterations = 5;
            let expected = reference(
                &[
                    (Padding::Nearest, 0, cross_ref as RefFn),
                    (padding, 7, skewed_ref as RefFn),
                ],
                iterations,
                shape,
                &data,
            );
            assert_eq!(run(&stencil, 1, iterations, shape, &data), expected);

            for devices in 2..=3 {
                for s in 1..=iterations {
                    stencil.set_iterations_between_swaps(Some(s));
                    assert_eq!(
                        run(&stencil, devices, iterations, shape, &data),
                        expected,
                        "padding={:?} devices={} s={}",
                        padding,
                        devices,
                        s
                    );
                }
            }
        }
    }

    #[test]
    fn test_swap_interval_limited() {
        let context = context(3);
        let input = Matrix::from_vec(&context, (6, 1), (0..6).collect::<Vec<i64>>()).unwrap();
        let mut stencil = Stencil::new(cross());
        stencil.set_iterations_between_swaps(Some(10));

        let output = stencil.matrix(4, &input).unwrap();
        match input.distribution() {
            Distribution::Stencil(dist) => assert_eq!(dist.iterations_between_swaps(), 2),
            other => panic!("unexpected distribution {:?}", other),
        }

        let expected = reference(
            &[(Padding::Nearest, 0, cross_ref as RefFn)],
            4,
            Shape::new(6, 1),
            &(0..6).collect_vec(),
        );
        assert_eq!(output.to_vec().unwrap(), expected);
    }

    #[test]
    fn test_single_step_without_temp() {
        let context = context(2);
        let input = Matrix::from_vec(&context, (4, 2), (0..8).collect::<Vec<i64>>()).unwrap();
        let output = Matrix::filled(&context, (4, 2), 0i64);

        let stencil = Stencil::new(cross());
        stencil.call(1, &input, &output, &output).unwrap();

        let expected = reference(
            &[(Padding::Nearest, 0, cross_ref as RefFn)],
            1,
            Shape::new(4, 2),
            &(0..8).collect_vec(),
        );
        assert_eq!(output.to_vec().unwrap(), expected);
    }

    #[test]
    fn test_aliased() {
        let context = context(1);
        let input = Matrix::filled(&context, (4, 4), 1i64);
        let other = Matrix::filled(&context, (4, 4), 1i64);

        let stencil = Stencil::new(cross());
        let err = stencil.call(2, &input, &other, &input).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::Aliased(_))
        ));

        let err = stencil.call(2, &input, &other, &other).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::Aliased(_))
        ));

        assert!(stencil.call(0, &input, &other, &other).is_err());
    }

    #[test]
    fn test_zero_sized() {
        let context = context(2);
        let stencil = Stencil::new(cross());

        for &shape in &[(0, 3), (3, 0)] {
            let input = Matrix::<i64>::filled(&context, shape, 1);
            let err = stencil.matrix(1, &input).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ContainerError>(),
                Some(ContainerError::ZeroSized(_))
            ));
        }
    }

    #[test]
    fn test_iterations_from_config() {
        let mut config = Config::host(2);
        config.skeleton.iterations_between_swaps = Some(3);
        let context = Context::new(config).unwrap();

        let input = Matrix::from_vec(&context, (12, 1), (0..12).collect::<Vec<i64>>()).unwrap();
        let output = Stencil::new(cross()).matrix(5, &input).unwrap();

        match input.distribution() {
            Distribution::Stencil(dist) => assert_eq!(dist.iterations_between_swaps(), 3),
            other => panic!("unexpected distribution {:?}", other),
        }

        let expected = reference(
            &[(Padding::Nearest, 0, cross_ref as RefFn)],
            5,
            Shape::new(12, 1),
            &(0..12).collect_vec(),
        );
        assert_eq!(output.to_vec().unwrap(), expected);
    }
}
