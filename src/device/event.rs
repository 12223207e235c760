use parskel_core::util::{Future, Promise};
use parskel_core::{copy_from_bytes, Element};

use super::{DeviceError, DeviceId, InUseGuard};
use crate::prelude::*;

/// Handed to a backend together with a command. The backend must call [`Completion::complete`]
/// once the command has finished executing.
#[derive(Debug)]
pub struct Completion<T = ()> {
    promise: Promise<Result<T>>,
    guards: Vec<InUseGuard>,
}

impl<T> Completion<T> {
    pub(crate) fn new(guards: Vec<InUseGuard>) -> (Self, Future<Result<T>>) {
        let (promise, future) = Promise::new();
        (Self { promise, guards }, future)
    }

    pub fn complete(self, result: Result<T>) {
        let Completion { promise, guards } = self;

        // Buffers are released before waiters wake up.
        drop(guards);
        promise.complete(result);
    }

    pub fn complete_ok(self, value: T) {
        self.complete(Ok(value))
    }
}

fn resolve<T>(device: DeviceId, future: Future<Result<T>>) -> Result<T> {
    match future.wait() {
        Ok(result) => result.with_context(|| format!("command on device {} failed", device)),
        Err(_) => Err(DeviceError::QueueShutDown(device).into()),
    }
}

/// Completion of a write, copy or kernel launch.
#[must_use]
#[derive(Debug)]
pub struct Event {
    device: DeviceId,
    future: Future<Result>,
}

impl Event {
    pub(crate) fn new(device: DeviceId, future: Future<Result>) -> Self {
        Self { device, future }
    }

    pub fn ready(device: DeviceId) -> Self {
        Self::new(device, Future::ready(Ok(())))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_complete(&self) -> bool {
        self.future.is_ready()
    }

    pub fn wait(self) -> Result {
        resolve(self.device, self.future)
    }
}

/// Completion of a read. Waiting yields the bytes that were read.
#[must_use]
#[derive(Debug)]
pub struct ReadEvent {
    device: DeviceId,
    future: Future<Result<Vec<u8>>>,
}

impl ReadEvent {
    pub(crate) fn new(device: DeviceId, future: Future<Result<Vec<u8>>>) -> Self {
        Self { device, future }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_complete(&self) -> bool {
        self.future.is_ready()
    }

    pub fn wait(self) -> Result<Vec<u8>> {
        resolve(self.device, self.future)
    }

    /// Wait for the read and copy the result into `output`, which must have exactly the length
    /// of the read.
    pub fn wait_into<T: Element>(self, output: &mut [T]) -> Result {
        let device = self.device;
        let bytes = self.wait()?;

        ensure!(
            bytes.len() == output.len() * T::size_in_bytes(),
            "read of {} bytes from device {} does not fit output of {} elements",
            bytes.len(),
            device,
            output.len()
        );

        copy_from_bytes(&bytes, output);
        Ok(())
    }

    pub fn wait_vec<T: Element>(self) -> Result<Vec<T>> {
        let bytes = self.wait()?;
        let mut output = vec![T::default(); bytes.len() / T::size_in_bytes()];
        copy_from_bytes(&bytes, &mut output);
        Ok(output)
    }
}

/// Group of events that can be waited on together.
#[must_use]
#[derive(Debug, Default)]
pub struct EventSet {
    events: Vec<Event>,
}

impl EventSet {
    pub fn new() -> Self {
        default()
    }

    pub fn insert(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn extend(&mut self, other: EventSet) {
        self.events.extend(other.events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Block until every event in the set has completed. All events are waited on, even if an
    /// earlier one failed. The first error is returned.
    pub fn wait(self) -> Result {
        let mut result = Ok(());

        for event in self.events {
            if let Err(e) = event.wait() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}

impl From<Event> for EventSet {
    fn from(event: Event) -> Self {
        Self {
            events: vec![event],
        }
    }
}

impl std::iter::FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_set() {
        let mut set = EventSet::new();
        let (a, fa) = Completion::<()>::new(vec![]);
        let (b, fb) = Completion::<()>::new(vec![]);

        set.insert(Event::new(DeviceId(0), fa));
        set.insert(Event::new(DeviceId(1), fb));
        set.insert(Event::ready(DeviceId(0)));
        assert_eq!(set.len(), 3);

        let handle = thread::spawn(move || {
            a.complete_ok(());
            b.complete(Err(anyhow!("boom")));
        });

        let err = set.wait().unwrap_err();
        assert!(format!("{:?}", err).contains("boom"));
        handle.join().unwrap();
    }

    #[test]
    fn test_dropped_completion() {
        let (completion, future) = Completion::<Vec<u8>>::new(vec![]);
        drop(completion);

        let err = ReadEvent::new(DeviceId(3), future).wait().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::QueueShutDown(DeviceId(3)))
        ));
    }

    #[test]
    fn test_wait_into() {
        let (completion, future) = Completion::<Vec<u8>>::new(vec![]);
        completion.complete_ok(parskel_core::to_bytes(&[1u32, 2, 3]));

        let mut output = [0u32; 3];
        ReadEvent::new(DeviceId(0), future)
            .wait_into(&mut output)
            .unwrap();
        assert_eq!(output, [1, 2, 3]);
    }
}
