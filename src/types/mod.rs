mod config;

pub use config::{BackendKind, Config, DeviceConfig, DeviceSelection, SkeletonConfig};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimensions of a container. A vector of `n` elements has shape `n x 1`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub columns: usize,
}

impl Shape {
    pub const fn new(rows: usize, columns: usize) -> Self {
        Self { rows, columns }
    }

    pub const fn vector(len: usize) -> Self {
        Self::new(len, 1)
    }

    pub const fn len(&self) -> usize {
        self.rows * self.columns
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear index of the element at `(row, column)` in row-major order.
    #[inline]
    pub fn index(&self, row: usize, column: usize) -> usize {
        assert!(
            row < self.rows && column < self.columns,
            "index ({}, {}) out of bounds for {:?}",
            row,
            column,
            self
        );
        row * self.columns + column
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.columns)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<usize> for Shape {
    fn from(len: usize) -> Self {
        Shape::vector(len)
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, columns): (usize, usize)) -> Self {
        Shape::new(rows, columns)
    }
}
