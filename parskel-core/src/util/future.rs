use crate::prelude::*;
use parking_lot::Condvar;
use std::fmt;
use std::sync::Arc;

/// Value of `T` which will arrive at some later point in time.
#[derive(Debug)]
pub struct Future<T = ()> {
    inner: Arc<Inner<T>>,
}

/// Object used to resolve a `Future<T>`.
#[derive(Debug)]
pub struct Promise<T = ()> {
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Debug)]
struct Inner<T> {
    cond: Condvar,
    state: Mutex<State<T>>,
}

use State::*;

enum State<T> {
    Empty,
    Completed(T),
    Taken,
    Poisoned,
}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Empty => write!(f, "Empty"),
            Completed(_) => write!(f, "Completed(_)"),
            Taken => write!(f, "Taken"),
            Poisoned => write!(f, "Poisoned"),
        }
    }
}

impl<T> Promise<T> {
    /// Create a new future and promise. The promise should be given to the producer to write
    /// the value while the future must be given to the consumer to read the value.
    pub fn new() -> (Promise<T>, Future<T>) {
        let inner = Arc::new(Inner {
            cond: Condvar::new(),
            state: Mutex::new(Empty),
        });

        let future = Future {
            inner: Arc::clone(&inner),
        };

        (Promise { inner: Some(inner) }, future)
    }

    /// Complete this promise with the given value. This will resolve the associated [`Future`].
    pub fn complete(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.state.lock();
            if let Empty = &*state {
                *state = Completed(value);
            }

            inner.cond.notify_all();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.state.lock();
            if let Empty = &*state {
                *state = Poisoned;
            }

            inner.cond.notify_all();
        }
    }
}

/// Error indicating that a promise was dropped before it was completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("promise dropped while waiting for future to complete")]
pub struct FutureError;

impl<T> Future<T> {
    /// Returns a future that is already resolved to the given value.
    pub fn ready(value: T) -> Self {
        Future {
            inner: Arc::new(Inner {
                cond: Condvar::new(),
                state: Mutex::new(Completed(value)),
            }),
        }
    }

    /// Returns `true` if calling [`Future::wait`] will not block.
    pub fn is_ready(&self) -> bool {
        !matches!(&*self.inner.state.lock(), Empty)
    }

    /// Blocks the caller until the value of `T` is available.
    ///
    /// Returns an error if the associated [`Promise`] was dropped without completing it.
    pub fn wait(self) -> Result<T, FutureError> {
        let mut state = self.inner.state.lock();

        loop {
            match replace(&mut *state, Taken) {
                Empty => {
                    *state = Empty;
                    self.inner.cond.wait(&mut state);
                }
                Completed(value) => break Ok(value),
                Poisoned => {
                    *state = Poisoned;
                    break Err(FutureError);
                }
                Taken => unreachable!("future was already consumed"),
            }
        }
    }
}
