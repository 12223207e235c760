//! Programs for the host backend.
//!
//! Each skeleton passes its kernels a fixed list of arguments, followed by the additional
//! arguments given by the user. The functions in this module wrap a plain Rust closure into a
//! [`Program`] that understands this argument list, which is the easiest way to use the
//! skeletons on the host backend.
use parskel_core::Element;

use crate::device::{Program, WorkItem};
use crate::distribution::{Extents, Padding};
use crate::prelude::*;

pub(crate) const MAP_ARGS: usize = 3;
pub(crate) const ZIP_ARGS: usize = 4;
pub(crate) const MAP_OVERLAP_ARGS: usize = 8;
pub(crate) const ALL_PAIRS_ARGS: usize = 6;
pub(crate) const STENCIL_ARGS: usize = 16;

/// Additional arguments passed to a skeleton call.
pub struct Extra<'a, 'b> {
    item: &'a WorkItem<'b>,
    base: usize,
}

impl<'a, 'b> Extra<'a, 'b> {
    fn new(item: &'a WorkItem<'b>, base: usize) -> Self {
        Self { item, base }
    }

    pub fn len(&self) -> usize {
        self.item.num_args().saturating_sub(self.base)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value<V: Element>(&self, arg: usize) -> V {
        self.item.value(self.base + arg)
    }

    pub fn load<V: Element>(&self, arg: usize, index: usize) -> V {
        self.item.load(self.base + arg, index)
    }

    /// Number of elements in the buffer passed as additional argument `arg`.
    pub fn buffer_len<V: Element>(&self, arg: usize) -> usize {
        self.item.len::<V>(self.base + arg)
    }
}

/// Program for [`Map`](super::Map).
pub fn map_program<T, U, F>(fun: F) -> Program
where
    T: Element,
    U: Element,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    map_program_with(move |x, _: &Extra<'_, '_>| fun(x))
}

/// Program for [`Map`](super::Map) that reads additional arguments.
pub fn map_program_with<T, U, F>(fun: F) -> Program
where
    T: Element,
    U: Element,
    F: Fn(T, &Extra<'_, '_>) -> U + Send + Sync + 'static,
{
    Program::host("map", move |item| {
        let i = item.global_id(0);
        let n = item.value::<u64>(2) as usize;

        if i < n {
            let value = fun(item.load(0, i), &Extra::new(item, MAP_ARGS));
            item.store::<U>(1, i, value);
        }
    })
}

/// Program for [`Zip`](super::Zip).
pub fn zip_program<L, R, U, F>(fun: F) -> Program
where
    L: Element,
    R: Element,
    U: Element,
    F: Fn(L, R) -> U + Send + Sync + 'static,
{
    zip_program_with(move |l, r, _: &Extra<'_, '_>| fun(l, r))
}

/// Program for [`Zip`](super::Zip) that reads additional arguments.
pub fn zip_program_with<L, R, U, F>(fun: F) -> Program
where
    L: Element,
    R: Element,
    U: Element,
    F: Fn(L, R, &Extra<'_, '_>) -> U + Send + Sync + 'static,
{
    Program::host("zip", move |item| {
        let i = item.global_id(0);
        let n = item.value::<u64>(3) as usize;

        if i < n {
            let value = fun(
                item.load(0, i),
                item.load(1, i),
                &Extra::new(item, ZIP_ARGS),
            );
            item.store::<U>(2, i, value);
        }
    })
}

/// Program for [`Reduce`](super::Reduce). Every work item folds one chunk of the input from
/// left to right, so `op` only needs to be associative.
pub fn reduce_program<T, F>(op: F) -> Program
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    Program::host("reduce", move |item| {
        let i = item.global_id(0);
        let n = item.value::<u64>(2) as usize;
        let chunk = item.value::<u64>(3) as usize;
        let start = i * chunk;

        if start < n {
            let end = min(n, start + chunk);
            let mut acc: T = item.load(0, start);

            for j in start + 1..end {
                acc = op(acc, item.load(0, j));
            }

            item.store(1, i, acc);
        }
    })
}

/// Program for [`Scan`](super::Scan).
///
/// The scan runs in three phases. Phase 0 scans every chunk and stores the chunk totals,
/// phase 1 scans the totals (starting from the carry of the previous device) and phase 2 adds
/// the total of all preceding chunks to every chunk.
pub fn scan_program<T, F>(op: F) -> Program
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    Program::host("scan", move |item| {
        let i = item.global_id(0);
        let n = item.value::<u64>(3) as usize;
        let chunk = item.value::<u64>(4) as usize;
        let phase = item.value::<u32>(5);
        let carry = if item.value::<u32>(7) != 0 {
            Some(item.value::<T>(6))
        } else {
            None
        };

        let start = i * chunk;
        let end = min(n, start + chunk);

        match phase {
            0 if start < n => {
                let mut acc: T = item.load(0, start);
                item.store(1, start, acc);

                for j in start + 1..end {
                    acc = op(acc, item.load(0, j));
                    item.store(1, j, acc);
                }

                item.store(2, i, acc);
            }
            1 if i == 0 => {
                let mut acc = carry;

                for k in 0..div_ceil(n, chunk) {
                    let total: T = item.load(2, k);
                    let total = match acc {
                        Some(prefix) => op(prefix, total),
                        None => total,
                    };

                    item.store(2, k, total);
                    acc = Some(total);
                }
            }
            2 if start < n => {
                let prefix = if i > 0 { Some(item.load(2, i - 1)) } else { carry };

                if let Some(prefix) = prefix {
                    for j in start..end {
                        let value = op(prefix, item.load(1, j));
                        item.store(1, j, value);
                    }
                }
            }
            _ => {}
        }
    })
}

/// Neighborhood of one element, given to the function of a [`MapOverlap`](super::MapOverlap).
pub struct OverlapView<'a, 'b> {
    item: &'a WorkItem<'b>,
    row: usize,
    column: usize,
    buffer_row: usize,
    columns: usize,
    radius: usize,
    padding: Padding,
}

impl<'a, 'b> OverlapView<'a, 'b> {
    /// Row of the element in the container.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// Element at `row_offset` rows and `column_offset` columns from the center. Both offsets
    /// must lie within the radius.
    pub fn get<T: Element>(&self, row_offset: isize, column_offset: isize) -> T {
        debug_assert!(row_offset.unsigned_abs() <= self.radius);
        debug_assert!(column_offset.unsigned_abs() <= self.radius);

        let row = (self.buffer_row as isize + row_offset) as usize;
        let mut column = self.column as isize + column_offset;

        if column < 0 || column >= self.columns as isize {
            match self.padding {
                Padding::Nearest => column = column.clamp(0, self.columns as isize - 1),
                _ => return self.item.value(7),
            }
        }

        self.item.load(0, row * self.columns + column as usize)
    }

    /// Element at `offset` rows from the center. Convenient for vectors.
    pub fn at<T: Element>(&self, offset: isize) -> T {
        self.get(offset, 0)
    }

    pub fn center<T: Element>(&self) -> T {
        self.get(0, 0)
    }

    pub fn extra(&self) -> Extra<'a, 'b> {
        Extra::new(self.item, MAP_OVERLAP_ARGS)
    }
}

/// Program for [`MapOverlap`](super::MapOverlap).
pub fn map_overlap_program<U, F>(fun: F) -> Program
where
    U: Element,
    F: Fn(&OverlapView<'_, '_>) -> U + Send + Sync + 'static,
{
    Program::host("map_overlap", move |item| {
        let column = item.global_id(0);
        let row = item.global_id(1);
        let first_row = item.value::<u64>(2) as usize;
        let rows = item.value::<u64>(3) as usize;
        let columns = item.value::<u64>(4) as usize;
        let radius = item.value::<u64>(5) as usize;
        let padding = Padding::from_u32(item.value(6)).unwrap_or(Padding::Neutral);

        if row < rows && column < columns {
            let view = OverlapView {
                item: &*item,
                row: first_row + row,
                column,
                buffer_row: row + radius,
                columns,
                radius,
                padding,
            };

            let value = fun(&view);
            item.store::<U>(1, row * columns + column, value);
        }
    })
}

/// Program for [`AllPairs`](super::AllPairs). The function receives a row of the left matrix
/// and a column of the right matrix.
pub fn all_pairs_program<T, U, F>(fun: F) -> Program
where
    T: Element,
    U: Element,
    F: Fn(&[T], &[T]) -> U + Send + Sync + 'static,
{
    all_pairs_program_with(move |left: &[T], right: &[T], _: &Extra<'_, '_>| fun(left, right))
}

/// Program for [`AllPairs`](super::AllPairs) that reads additional arguments.
pub fn all_pairs_program_with<T, U, F>(fun: F) -> Program
where
    T: Element,
    U: Element,
    F: Fn(&[T], &[T], &Extra<'_, '_>) -> U + Send + Sync + 'static,
{
    Program::host("all_pairs", move |item| {
        let column = item.global_id(0);
        let row = item.global_id(1);
        let rows = item.value::<u64>(3) as usize;
        let depth = item.value::<u64>(4) as usize;
        let columns = item.value::<u64>(5) as usize;

        if row < rows && column < columns {
            let left = (0..depth)
                .map(|k| item.load::<T>(0, row * depth + k))
                .collect_vec();
            let right = (0..depth)
                .map(|k| item.load::<T>(1, k * columns + column))
                .collect_vec();

            let value = fun(&left, &right, &Extra::new(item, ALL_PAIRS_ARGS));
            item.store::<U>(2, row * columns + column, value);
        }
    })
}

/// Neighborhood of one element, given to the function of a [`Stencil`](super::Stencil).
pub struct StencilView<'a, 'b> {
    item: &'a WorkItem<'b>,
    row: usize,
    column: usize,
    buffer_first_row: usize,
    buffer_rows: usize,
    rows: usize,
    columns: usize,
    extents: Extents,
    padding: Padding,
}

impl<'a, 'b> StencilView<'a, 'b> {
    /// Row of the element in the container.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// Element at `row_offset` rows and `column_offset` columns from the center. Negative
    /// offsets point north and west. Elements outside of the container are replaced according
    /// to the padding of the stencil.
    pub fn get<T: Element>(&self, row_offset: isize, column_offset: isize) -> T {
        debug_assert!(-row_offset <= self.extents.north as isize);
        debug_assert!(row_offset <= self.extents.south as isize);
        debug_assert!(-column_offset <= self.extents.west as isize);
        debug_assert!(column_offset <= self.extents.east as isize);

        let row = self.row as isize + row_offset;
        let column = self.column as isize + column_offset;
        let inside = row >= 0
            && row < self.rows as isize
            && column >= 0
            && column < self.columns as isize;

        let arg = match self.padding {
            _ if inside => 0,
            Padding::Neutral => return self.item.value(14),
            Padding::Nearest => 0,
            Padding::NearestInitial => 2,
        };

        let row = row.clamp(0, self.rows as isize - 1) as usize;
        let column = column.clamp(0, self.columns as isize - 1) as usize;

        assert!(
            row >= self.buffer_first_row && row < self.buffer_first_row + self.buffer_rows,
            "row {} is not available on this device",
            row
        );

        self.item
            .load(arg, (row - self.buffer_first_row) * self.columns + column)
    }

    /// Element at `offset` rows from the center. Convenient for vectors.
    pub fn at<T: Element>(&self, offset: isize) -> T {
        self.get(offset, 0)
    }

    pub fn center<T: Element>(&self) -> T {
        self.get(0, 0)
    }

    pub fn extra(&self) -> Extra<'a, 'b> {
        Extra::new(self.item, STENCIL_ARGS)
    }
}

/// Program for one shape of a [`Stencil`](super::Stencil).
pub fn stencil_program<T, F>(fun: F) -> Program
where
    T: Element,
    F: Fn(&StencilView<'_, '_>) -> T + Send + Sync + 'static,
{
    Program::host("stencil", move |item| {
        let column = item.global_id(0);
        let row = item.global_id(1);
        let buffer_first_row = item.value::<u64>(3) as usize;
        let buffer_rows = item.value::<u64>(4) as usize;
        let compute_first_row = item.value::<u64>(5) as usize;
        let compute_rows = item.value::<u64>(6) as usize;
        let rows = item.value::<u64>(7) as usize;
        let columns = item.value::<u64>(8) as usize;
        let extents = Extents::new(
            item.value::<u64>(9) as usize,
            item.value::<u64>(10) as usize,
            item.value::<u64>(11) as usize,
            item.value::<u64>(12) as usize,
        );
        let padding = Padding::from_u32(item.value(13)).unwrap_or(Padding::Neutral);

        if row < compute_rows && column < columns {
            let view = StencilView {
                item: &*item,
                row: compute_first_row + row,
                column,
                buffer_first_row,
                buffer_rows,
                rows,
                columns,
                extents,
                padding,
            };

            let value = fun(&view);
            let index = (compute_first_row + row - buffer_first_row) * columns + column;
            item.store::<T>(1, index, value);
        }
    })
}
