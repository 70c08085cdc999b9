use parking_lot::{Mutex, MutexGuard};

/// A shared object which may only be used while its lock is held.
///
/// The guard returned by [Self::lock] releases the lock on every exit path.
#[derive(Debug, Default)]
pub struct SynchronizedValue<T> {
    inner: Mutex<T>,
}

impl<T> SynchronizedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = value;
    }
}

impl<T: Clone> SynchronizedValue<T> {
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }
}
