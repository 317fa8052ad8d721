//!
//! Binary Semaphore
//!
//! A semaphore whose count saturates at one. `up` on an already signaled
//! semaphore is a no-op, so the count can never grow past a single pending
//! wakeup.
//!
//! ```
//! use baton_std_sync::BinarySemaphore;
//!
//! let sem = BinarySemaphore::new(1);
//! sem.down();
//! assert!(!sem.is_signaled());
//! sem.up();
//! sem.up();
//! assert!(sem.is_signaled());
//! ```
//!

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct BinarySemaphore {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl BinarySemaphore {
    /// Creates a semaphore. Any non-zero `value` starts it signaled.
    pub fn new(value: u32) -> Self {
        Self {
            signaled: Mutex::new(value > 0),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the semaphore is signaled, then consumes the signal.
    pub fn down(&self) {
        let mut signaled = self.lock();
        while !*signaled {
            signaled = self
                .condvar
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Like `down`, but gives up after `timeout`.
    ///
    /// Returns `true` if the signal was consumed, `false` on timeout.
    pub fn down_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.lock();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
        }
        *signaled = false;
        true
    }

    /// Signals the semaphore and wakes one waiter.
    pub fn up(&self) {
        let mut signaled = self.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    pub fn is_signaled(&self) -> bool {
        *self.lock()
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for BinarySemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinarySemaphore")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
