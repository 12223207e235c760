//! Data-parallel skeletons over containers distributed across multiple devices.
//!
//! A [`Context`] owns the list of devices. Containers ([`Vector`], [`Matrix`]) keep a host copy
//! of their data together with one buffer per device, laid out according to their
//! [`Distribution`]. Data moves lazily: host accessors download stale data and skeletons upload
//! stale data before launching kernels.
#![allow(clippy::too_many_arguments, clippy::many_single_char_names)]

pub mod container;
pub mod context;
pub mod device;
pub mod distribution;
mod prelude;
pub mod skeleton;
pub mod types;

pub use container::{Container, Matrix, Vector};
pub use context::Context;
pub use distribution::{Distribution, Extents, Padding};
pub use parskel_core::{Element, One, Zero};
pub use skeleton::{AllPairs, Map, MapOverlap, Reduce, Scan, Stencil, StencilShape, Zip};
pub use types::{Config, Shape};

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    let _ = env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.06}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .try_init();
}
