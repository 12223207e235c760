//! Data-parallel operations over containers.
//!
//! Every skeleton follows the same steps: give the inputs a distribution if they have none,
//! make sure their device buffers exist and are up to date, compute the range of each device,
//! launch one kernel per device and finally mark the outputs as modified on the devices.

mod all_pairs;
pub mod host;
mod map;
mod map_overlap;
mod reduce;
mod scan;
mod stencil;
mod zip;

pub use all_pairs::AllPairs;
pub use map::Map;
pub use map_overlap::MapOverlap;
pub use reduce::Reduce;
pub use scan::Scan;
pub use stencil::{Stencil, StencilShape};
pub use zip::Zip;

use std::sync::Arc;

use crate::container::Container;
use crate::context::Context;
use crate::device::{Device, DeviceId, NDRange, Program};
use crate::distribution::{BlockDist, Distribution};
use crate::prelude::*;

/// Edge of the square tile used by two-dimensional launches.
const TILE_SIZE: usize = 16;

fn work_group_size(context: &Context, device: &Device) -> usize {
    max(
        1,
        min(
            context.config().skeleton.work_group_size,
            device.max_work_group_size(),
        ),
    )
}

/// Global and local size of a one-dimensional launch covering `n` work items.
fn launch_1d(context: &Context, device: &Device, n: usize) -> (NDRange, NDRange) {
    let local = min(work_group_size(context, device), max(n, 1));
    (NDRange::d1(round_up(n, local)), NDRange::d1(local))
}

/// Tile of at most `TILE_SIZE x TILE_SIZE` work items.
fn tile(device: &Device) -> NDRange {
    let x = min(TILE_SIZE, device.max_work_group_size());
    let y = max(1, min(TILE_SIZE, device.max_work_group_size() / x));
    NDRange::d2(x, y)
}

/// Global and local size of a two-dimensional launch covering `columns x rows` work items.
fn launch_2d(device: &Device, columns: usize, rows: usize) -> (NDRange, NDRange) {
    let local = tile(device);
    let global = NDRange::d2(round_up(columns, local.x), round_up(rows, local.y));
    (global, local)
}

fn all_devices(context: &Context) -> Vec<DeviceId> {
    context.devices().ids()
}

/// Devices of the current distribution, or all devices if there is none.
fn devices_of<T: Element>(context: &Context, input: &dyn Container<T>) -> Vec<DeviceId> {
    let distribution = input.distribution();

    if distribution.is_valid() {
        distribution.devices().to_vec()
    } else {
        all_devices(context)
    }
}

/// Give `input` the default block distribution if it has no valid distribution yet.
fn prepare_input<T: Element>(input: &dyn Container<T>) -> Result {
    if !input.distribution().is_valid() {
        let devices = all_devices(input.context());
        input.set_distribution(Distribution::block(&devices))?;
    }

    Ok(())
}

/// Make sure `input` is split into disjoint blocks, keeping its devices.
fn prepare_blocks<T: Element>(input: &dyn Container<T>) -> Result<BlockDist> {
    let block = match input.distribution() {
        Distribution::Block(block) => block,
        Distribution::Single(single) => BlockDist::new(&[single.device()]),
        Distribution::Overlap(overlap) => overlap.block().clone(),
        _ => BlockDist::new(&devices_of(input.context(), input)),
    };

    input.set_distribution(Distribution::Block(block.clone()))?;
    Ok(block)
}

fn device(context: &Context, id: DeviceId) -> Result<&Arc<Device>> {
    context.device(id)
}

fn check_not_aliased<T: Element, U: Element>(
    a: &dyn Container<T>,
    b: &dyn Container<U>,
    what: &'static str,
) -> Result {
    let a = Arc::as_ptr(a.data()) as *const u8;
    let b = Arc::as_ptr(b.data()) as *const u8;

    if a == b {
        return Err(crate::container::ContainerError::Aliased(what).into());
    }

    Ok(())
}

/// Skeletons reading a neighborhood need at least one row and one column.
fn check_not_zero_sized<T: Element>(container: &dyn Container<T>) -> Result {
    let shape = container.shape();

    if shape.rows == 0 || shape.columns == 0 {
        return Err(crate::container::ContainerError::ZeroSized(shape).into());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_launch_sizes() {
        let context = Context::host(1).unwrap();
        let device = &context.devices()[DeviceId(0)];

        assert_eq!(
            launch_1d(&context, device, 1000),
            (NDRange::d1(1024), NDRange::d1(256))
        );
        assert_eq!(launch_1d(&context, device, 3), (NDRange::d1(3), NDRange::d1(3)));
        assert_eq!(launch_1d(&context, device, 0), (NDRange::d1(0), NDRange::d1(1)));

        assert_eq!(tile(device), NDRange::d2(16, 16));
        assert_eq!(
            launch_2d(device, 20, 3),
            (NDRange::d2(32, 16), NDRange::d2(16, 16))
        );
    }
}
