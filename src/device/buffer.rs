use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::DeviceId;

/// Backend-specific storage behind a [`DeviceBuffer`].
pub trait RawMemory: Send + Sync + fmt::Debug + 'static {
    fn size_in_bytes(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
struct BufferInner {
    id: u64,
    device: DeviceId,
    len: usize,
    elem_size: usize,
    memory: Arc<dyn RawMemory>,
    in_use: AtomicUsize,
}

/// Handle to `size()` elements of `elem_size()` bytes each on a single device.
///
/// Cloning the handle does not copy the memory. The memory is released once the last handle is
/// dropped, which includes the handles held by commands that are still queued on the device.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

impl DeviceBuffer {
    pub(crate) fn new(
        device: DeviceId,
        len: usize,
        elem_size: usize,
        memory: Arc<dyn RawMemory>,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        assert!(memory.size_in_bytes() >= len * elem_size);

        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                device,
                len,
                elem_size,
                memory,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Unique identifier of this buffer. Clones share the same identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.inner.len
    }

    pub fn elem_size(&self) -> usize {
        self.inner.elem_size
    }

    pub fn size_in_bytes(&self) -> usize {
        self.inner.len * self.inner.elem_size
    }

    pub(crate) fn memory(&self) -> &Arc<dyn RawMemory> {
        &self.inner.memory
    }

    pub fn mark_as_in_use(&self) {
        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_as_not_in_use(&self) {
        let old = self.inner.in_use.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "buffer {} was not marked as in use", self.inner.id);
    }

    pub fn is_in_use(&self) -> bool {
        self.inner.in_use.load(Ordering::SeqCst) > 0
    }

    pub fn ptr_eq(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("size", &self.inner.len)
            .field("elem_size", &self.inner.elem_size)
            .finish()
    }
}

/// Keeps a buffer marked as in use for as long as the guard lives.
#[derive(Debug)]
pub struct InUseGuard(DeviceBuffer);

impl InUseGuard {
    pub fn new(buffer: &DeviceBuffer) -> Self {
        buffer.mark_as_in_use();
        Self(buffer.clone())
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.0.mark_as_not_in_use();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Dummy(usize);

    impl RawMemory for Dummy {
        fn size_in_bytes(&self) -> usize {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_buffer_in_use() {
        let buffer = DeviceBuffer::new(DeviceId(0), 10, 4, Arc::new(Dummy(40)));
        assert_eq!(buffer.size(), 10);
        assert_eq!(buffer.size_in_bytes(), 40);
        assert!(!buffer.is_in_use());

        let a = InUseGuard::new(&buffer);
        let b = InUseGuard::new(&buffer.clone());
        assert!(buffer.is_in_use());

        drop(a);
        assert!(buffer.is_in_use());
        drop(b);
        assert!(!buffer.is_in_use());
    }

    #[test]
    fn test_buffer_identity() {
        let a = DeviceBuffer::new(DeviceId(0), 1, 4, Arc::new(Dummy(4)));
        let b = DeviceBuffer::new(DeviceId(0), 1, 4, Arc::new(Dummy(4)));

        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic]
    fn test_unbalanced_not_in_use() {
        let a = DeviceBuffer::new(DeviceId(0), 1, 4, Arc::new(Dummy(4)));
        a.mark_as_not_in_use();
    }
}
