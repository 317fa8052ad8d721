//!
//! baton-std-sync - Blocking Synchronization Primitives
//!
//! The scheduler in `baton-runtime` serializes its logical threads by parking
//! every backing OS thread on a primitive from this crate:
//!
//! - `BinarySemaphore` - the per-thread baton (`down`, `down_timeout`, `up`)
//! - `Latch<T>` - a write-once cell that wakes every waiter when set
//!
//! Both are built on `std::sync::Mutex` + `Condvar`. Lock poisoning is
//! ignored: the protected state is a plain value that is never left
//! half-updated.
//!

pub mod semaphore;
pub mod latch;

pub use semaphore::*;
pub use latch::*;
