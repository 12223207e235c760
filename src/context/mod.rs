use std::sync::Arc;

use crate::container::{Container, Matrix, Vector};
use crate::device::{Device, DeviceId, DeviceList};
use crate::distribution::Distribution;
use crate::prelude::*;
use crate::types::{Config, Shape};

#[derive(Debug)]
struct ContextInner {
    devices: DeviceList,
    config: Config,
}

/// Runtime context. Owns the devices and the configuration shared by containers and skeletons.
///
/// Cloning a context is cheap and yields a handle to the same devices.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Option<Context>> = Mutex::new(None);
}

impl Context {
    /// Discover the devices described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        let devices = DeviceList::discover(&config.device)?;
        Ok(Self::with_devices(devices, config))
    }

    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env())
    }

    /// Context with `count` devices emulated on the host.
    pub fn host(count: usize) -> Result<Self> {
        Self::new(Config::host(count))
    }

    pub fn with_devices(devices: DeviceList, config: Config) -> Self {
        Self {
            inner: Arc::new(ContextInner { devices, config }),
        }
    }

    /// Initialize the process-wide context. Fails if it was already initialized.
    pub fn init(config: Config) -> Result<Self> {
        let mut global = GLOBAL.lock();
        if global.is_some() {
            bail!("the global context has already been initialized");
        }

        let context = Self::new(config)?;
        *global = Some(context.clone());
        Ok(context)
    }

    /// Returns the process-wide context, initializing it from the environment on first use.
    pub fn global() -> Result<Self> {
        let mut global = GLOBAL.lock();

        if let Some(context) = &*global {
            return Ok(context.clone());
        }

        let context = Self::from_env()?;
        *global = Some(context.clone());
        Ok(context)
    }

    pub fn devices(&self) -> &DeviceList {
        &self.inner.devices
    }

    pub fn device(&self, id: DeviceId) -> Result<&Arc<Device>> {
        self.inner
            .devices
            .get(id)
            .ok_or_else(|| anyhow!("device {} does not exist", id))
    }

    pub fn num_devices(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Block until every command submitted to any device has completed.
    pub fn synchronize(&self) -> Result {
        self.inner.devices.wait_all()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn vector<T: Element>(&self, data: Vec<T>) -> Vector<T> {
        Vector::from_vec(self, data)
    }

    pub fn vector_with_distribution<T: Element>(
        &self,
        data: Vec<T>,
        distribution: Distribution<T>,
    ) -> Result<Vector<T>> {
        let vector = Vector::from_vec(self, data);
        vector.set_distribution(distribution)?;
        Ok(vector)
    }

    pub fn matrix<T: Element>(&self, shape: impl Into<Shape>, data: Vec<T>) -> Result<Matrix<T>> {
        Matrix::from_vec(self, shape, data)
    }

    pub fn zeros<T: Element>(&self, shape: impl Into<Shape>) -> Matrix<T> {
        Matrix::filled(self, shape, T::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_context() {
        let context = Context::host(2).unwrap();
        assert_eq!(context.num_devices(), 2);
        assert!(context.device(DeviceId(1)).is_ok());
        assert!(context.device(DeviceId(2)).is_err());
        assert!(context.ptr_eq(&context.clone()));
        context.synchronize().unwrap();
    }

    #[test]
    fn test_vector_with_distribution() {
        let context = Context::host(2).unwrap();
        let dist = Distribution::single(DeviceId(1));
        let vector = context
            .vector_with_distribution(vec![1u32, 2, 3], dist.clone())
            .unwrap();

        assert_eq!(vector.distribution(), dist);
        assert_eq!(vector.partitions()[0].device, DeviceId(1));
        assert_eq!(vector.to_vec().unwrap(), vec![1, 2, 3]);

        let invalid = Distribution::block(&[DeviceId(0), DeviceId(0)]);
        assert!(context.vector_with_distribution(vec![1u32], invalid).is_err());
    }

    #[test]
    fn test_global() {
        let a = Context::global().unwrap();
        let b = Context::global().unwrap();
        assert!(a.ptr_eq(&b));
        assert!(Context::init(Config::host(1)).is_err());
    }
}
