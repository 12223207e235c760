use std::fmt;
use std::sync::Arc;

use super::{Container, ContainerData, ContainerError};
use crate::context::Context;
use crate::distribution::Distribution;
use crate::prelude::*;
use crate::types::Shape;

/// One-dimensional container. Distributions treat it as a matrix with a single column.
pub struct Vector<T: Element> {
    data: Arc<ContainerData<T>>,
}

impl<T: Element> Vector<T> {
    pub fn from_vec(context: &Context, data: Vec<T>) -> Self {
        Self {
            data: Arc::new(ContainerData::new(context, Shape::vector(data.len()), data)),
        }
    }

    pub fn from_slice(context: &Context, data: &[T]) -> Self {
        Self::from_vec(context, data.to_vec())
    }

    pub fn filled(context: &Context, len: usize, value: T) -> Self {
        Self::from_vec(context, vec![value; len])
    }

    pub fn with_distribution(
        context: &Context,
        data: Vec<T>,
        distribution: Distribution<T>,
    ) -> Result<Self> {
        let vector = Self::from_vec(context, data);
        vector.set_distribution(distribution)?;
        Ok(vector)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.data.get(index)
    }

    pub fn set(&self, index: usize, value: T) -> Result {
        self.data.set(index, value)
    }

    /// Change the length, filling new elements with `T::default()`.
    pub fn resize(&self, len: usize) -> Result {
        self.data.resize(Shape::vector(len), T::default())
    }

    /// Replace the contents with `data`, which must have the same length.
    pub fn copy_from(&self, data: &[T]) -> Result {
        let mut host = self.data.host_buffer_mut()?;

        if host.len() != data.len() {
            return Err(ContainerError::SizeMismatch {
                expected: host.len(),
                actual: data.len(),
            }
            .into());
        }

        host.copy_from_slice(data);
        Ok(())
    }

    /// Deep copy of this vector, including its distribution.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            data: Arc::new(self.data.duplicate()?),
        })
    }
}

impl<T: Element> Container<T> for Vector<T> {
    fn data(&self) -> &Arc<ContainerData<T>> {
        &self.data
    }
}

impl<T: Element> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Vector").field(&*self.data).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::DeviceId;

    #[test]
    fn test_vector() {
        let context = Context::host(2).unwrap();
        let v = Vector::filled(&context, 3, 1.5f64);
        assert_eq!(v.len(), 3);
        assert_eq!(v.shape(), Shape::new(3, 1));
        assert_eq!(v.get(2).unwrap(), 1.5);
        assert!(v.get(3).is_err());
        assert!(v.set(3, 0.0).is_err());

        v.resize(5).unwrap();
        assert_eq!(v.to_vec().unwrap(), [1.5, 1.5, 1.5, 0.0, 0.0]);

        assert!(v.copy_from(&[1.0; 4]).is_err());
        v.copy_from(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(v.get(4).unwrap(), 5.0);

        let w = Vector::with_distribution(
            &context,
            vec![1u32, 2],
            Distribution::single(DeviceId(1)),
        )
        .unwrap();
        assert_eq!(w.distribution(), Distribution::single(DeviceId(1)));

        let copy = v.try_clone().unwrap();
        assert!(!v.same_container(&copy));
        assert!(v.same_container(&v));
        assert_eq!(copy.to_vec().unwrap(), v.to_vec().unwrap());
    }
}
