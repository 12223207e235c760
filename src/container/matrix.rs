use std::fmt;
use std::sync::Arc;

use super::{Container, ContainerData, ContainerError};
use crate::context::Context;
use crate::distribution::Distribution;
use crate::prelude::*;
use crate::types::Shape;

/// Two-dimensional container stored in row-major order. Distributions split it by rows.
pub struct Matrix<T: Element> {
    data: Arc<ContainerData<T>>,
}

impl<T: Element> Matrix<T> {
    pub fn from_vec(context: &Context, shape: impl Into<Shape>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();

        if shape.len() != data.len() {
            return Err(ContainerError::SizeMismatch {
                expected: shape.len(),
                actual: data.len(),
            }
            .into());
        }

        Ok(Self {
            data: Arc::new(ContainerData::new(context, shape, data)),
        })
    }

    pub fn filled(context: &Context, shape: impl Into<Shape>, value: T) -> Self {
        let shape = shape.into();

        Self {
            data: Arc::new(ContainerData::new(
                context,
                shape,
                vec![value; shape.len()],
            )),
        }
    }

    /// Matrix built from rows of equal length.
    pub fn from_rows(context: &Context, rows: &[Vec<T>]) -> Result<Self> {
        let columns = rows.first().map_or(0, |row| row.len());

        for row in rows {
            if row.len() != columns {
                return Err(ContainerError::SizeMismatch {
                    expected: columns,
                    actual: row.len(),
                }
                .into());
            }
        }

        Self::from_vec(context, (rows.len(), columns), rows.concat())
    }

    pub fn with_distribution(
        context: &Context,
        shape: impl Into<Shape>,
        data: Vec<T>,
        distribution: Distribution<T>,
    ) -> Result<Self> {
        let matrix = Self::from_vec(context, shape, data)?;
        matrix.set_distribution(distribution)?;
        Ok(matrix)
    }

    pub fn rows(&self) -> usize {
        self.shape().rows
    }

    pub fn columns(&self) -> usize {
        self.shape().columns
    }

    fn index(&self, row: usize, column: usize) -> Result<usize> {
        let shape = self.shape();

        if row >= shape.rows || column >= shape.columns {
            return Err(ContainerError::OutOfBounds {
                index: row * shape.columns + column,
                len: shape.len(),
            }
            .into());
        }

        Ok(shape.index(row, column))
    }

    pub fn get(&self, row: usize, column: usize) -> Result<T> {
        self.data.get(self.index(row, column)?)
    }

    pub fn set(&self, row: usize, column: usize, value: T) -> Result {
        self.data.set(self.index(row, column)?, value)
    }

    pub fn row(&self, row: usize) -> Result<Vec<T>> {
        let columns = self.columns();
        let start = self.index(row, 0)?;
        Ok(self.data.host_buffer()?[start..start + columns].to_vec())
    }

    /// Change the shape. Elements at positions present in both shapes keep their value, new
    /// positions are filled with `value`.
    pub fn resize(&self, shape: impl Into<Shape>, value: T) -> Result {
        self.data.resize(shape.into(), value)
    }

    /// Deep copy of this matrix, including its distribution.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            data: Arc::new(self.data.duplicate()?),
        })
    }
}

impl<T: Element> Container<T> for Matrix<T> {
    fn data(&self) -> &Arc<ContainerData<T>> {
        &self.data
    }
}

impl<T: Element> fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Matrix").field(&*self.data).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_matrix() {
        let context = Context::host(1).unwrap();
        let m = Matrix::from_rows(&context, &[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!((m.rows(), m.columns()), (2, 3));
        assert_eq!(m.get(1, 0).unwrap(), 4);
        assert_eq!(m.row(1).unwrap(), [4, 5, 6]);
        assert!(m.get(0, 3).is_err());

        m.set(0, 2, 30).unwrap();
        assert_eq!(m.to_vec().unwrap(), [1, 2, 30, 4, 5, 6]);

        let err = Matrix::from_vec(&context, (2, 2), vec![1, 2, 3]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ContainerError>(),
            Some(&ContainerError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        );

        assert!(Matrix::from_rows(&context, &[vec![1], vec![2, 3]]).is_err());
        assert_eq!(Matrix::<u8>::filled(&context, (3, 3), 7).get(2, 2).unwrap(), 7);
    }
}
