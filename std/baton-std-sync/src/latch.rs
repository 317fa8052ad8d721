///
/// Write-once latch
///
/// Holds no value until `set` is called, after which every current and
/// future waiter observes the same value. Used as the "exited" signal of a
/// thread control block: exit sets it, any number of joiners wait on it.
///

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub struct Latch<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Copy> Latch<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` and wakes all waiters. Only the first call has any
    /// effect; it returns `false` if the latch was already set.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.condvar.notify_all();
        true
    }

    pub fn get(&self) -> Option<T> {
        *self.lock()
    }

    /// Blocks until the latch is set.
    pub fn wait(&self) -> T {
        let mut slot = self.lock();
        loop {
            if let Some(value) = *slot {
                return value;
            }
            slot = self.condvar.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Copy> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("value", &self.get()).finish()
    }
}
