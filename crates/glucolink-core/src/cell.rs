//! Synchronized value cell.
//!
//! A minimal mutex-guarded container for the one piece of state shared
//! between the radio callback context and external callers: the active
//! peripheral's identity. Not a general concurrency primitive.

use std::sync::Mutex;

/// A mutex-guarded single value with atomic read, write and mutate.
#[derive(Debug, Default)]
pub struct SyncCell<T> {
    inner: Mutex<T>,
}

impl<T: Clone> SyncCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Read a copy of the current value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Replace the current value.
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Apply a transformation under the lock and return the new value.
    pub fn mutate(&self, f: impl FnOnce(&mut T)) -> T {
        let mut guard = self.lock();
        f(&mut guard);
        guard.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        // A poisoned lock only means a panic elsewhere; the value itself
        // is still a plain clone-able T.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
