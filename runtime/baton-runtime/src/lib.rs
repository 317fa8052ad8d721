//!
//! baton-runtime - Cooperative User-Space Threads
//!
//! Multiplexes logical threads onto OS threads and serializes them with a
//! baton handoff: at any instant only the thread at the head of the ready
//! queue holds a signaled baton, so only that thread runs application code.
//!
//! ## Rust API
//!
//! ```rust,no_run
//! use baton_runtime::{Scheduler, SchedulerConfig};
//!
//! let sched = Scheduler::new(SchedulerConfig::default())?;
//! let handle = sched.clone();
//! let id = sched.spawn(move || {
//!     handle.yield_now();
//!     42
//! })?;
//! assert_eq!(sched.join(id)?, 42);
//! sched.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## C API
//!
//! `ffi` exports `baton_create`, `baton_yield`, `baton_join`, `baton_exit` and
//! `baton_self` (declared in `include/baton.h`) over a process-default
//! scheduler.
//!

pub mod config;
pub mod errors;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod ffi;

pub use config::SchedulerConfig;
pub use errors::{ConfigError, ThreadError};
pub use pool::{ExitCode, SchedPolicy, ThreadAttributes, ThreadId, ThreadKind, ThreadState};
pub use scheduler::{QueueSnapshot, Scheduler, IDLE_THREAD, PANIC_EXIT_CODE};
