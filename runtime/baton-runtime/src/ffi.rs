///
/// C ABI for baton
///
/// Exposes the thread API to C callers over a single process-default
/// scheduler, created on first use. Its configuration is read from the TOML
/// file named by the `BATON_CONFIG` environment variable, falling back to the
/// defaults when the variable is unset or the file is invalid.
///
/// All functions return `BATON_OK` (0) on success or a negative code from
/// `ThreadError::code` / `BATON_EINVAL`. Declarations live in
/// `include/baton.h`.
///

use std::ffi::{c_int, c_void};
use std::path::Path;
use std::sync::OnceLock;

use tracing::warn;

use crate::config::SchedulerConfig;
use crate::pool::{SchedPolicy, ThreadAttributes, ThreadId};
use crate::scheduler::Scheduler;

pub type BatonThread = usize;

/// Thread entry point. `C-unwind` so `baton_exit` can unwind through it.
pub type BatonStartFn = unsafe extern "C-unwind" fn(*mut c_void) -> c_int;

pub const BATON_OK: c_int = 0;
pub const BATON_EINVAL: c_int = -3;

/// Returned by `baton_self` when no thread has been created yet.
pub const BATON_NO_THREAD: BatonThread = usize::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BatonAttr {
    pub priority: c_int,
    /// 0 = cooperative, 1 = round-robin, 2 = FIFO.
    pub policy: c_int,
    /// Backing stack size in bytes; 0 uses the configured default.
    pub stack_size: usize,
}

struct SendPtr(*mut c_void);

// The pointer is handed to exactly one thread entry and never dereferenced here.
unsafe impl Send for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

static DEFAULT_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

fn default_config() -> SchedulerConfig {
    let Some(path) = std::env::var_os("BATON_CONFIG") else {
        return SchedulerConfig::default();
    };
    match SchedulerConfig::from_path(Path::new(&path)) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = ?path, error = %err, "ignoring BATON_CONFIG");
            SchedulerConfig::default()
        }
    }
}

/// The scheduler behind the C ABI.
pub fn default_scheduler() -> &'static Scheduler {
    DEFAULT_SCHEDULER.get_or_init(|| {
        Scheduler::new(default_config())
            .unwrap_or_else(|err| panic!("default scheduler config rejected: {}", err))
    })
}

fn policy_from_raw(raw: c_int) -> Option<SchedPolicy> {
    match raw {
        0 => Some(SchedPolicy::Cooperative),
        1 => Some(SchedPolicy::RoundRobin),
        2 => Some(SchedPolicy::Fifo),
        _ => None,
    }
}

/// Create a thread running `start(arg)`. `attr` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn baton_create(
    out: *mut BatonThread,
    attr: *const BatonAttr,
    start: Option<BatonStartFn>,
    arg: *mut c_void,
) -> c_int {
    let Some(start) = start else {
        return BATON_EINVAL;
    };

    let attrs = if attr.is_null() {
        ThreadAttributes::default()
    } else {
        let attr = unsafe { *attr };
        let Some(policy) = policy_from_raw(attr.policy) else {
            return BATON_EINVAL;
        };
        ThreadAttributes {
            name: None,
            priority: attr.priority,
            policy,
            stack_size: (attr.stack_size != 0).then_some(attr.stack_size),
        }
    };

    let arg = SendPtr(arg);
    let result = default_scheduler().create(&attrs, move || unsafe { start(arg.get()) });

    match result {
        Ok(id) => {
            if !out.is_null() {
                unsafe { *out = id.as_usize() };
            }
            BATON_OK
        }
        Err(err) => {
            warn!(error = %err, "baton_create failed");
            err.code()
        }
    }
}

/// Yield to the next thread. Only valid from a baton thread.
#[unsafe(no_mangle)]
pub extern "C" fn baton_yield() -> c_int {
    let sched = default_scheduler();
    if !sched.is_scheduled() {
        return BATON_EINVAL;
    }
    sched.yield_now();
    BATON_OK
}

/// Wait for thread `id` to exit. `status` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn baton_join(id: BatonThread, status: *mut c_int) -> c_int {
    match default_scheduler().join(ThreadId::new(id)) {
        Ok(code) => {
            if !status.is_null() {
                unsafe { *status = code };
            }
            BATON_OK
        }
        Err(err) => err.code(),
    }
}

/// End the calling baton thread with `retval`. Called from any other context
/// it terminates the process with `retval` as its exit status.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn baton_exit(retval: c_int) -> ! {
    let sched = default_scheduler();
    if sched.is_scheduled() {
        sched.exit(retval)
    }
    std::process::exit(retval)
}

/// Id of the calling baton thread (or the queue head from other contexts).
#[unsafe(no_mangle)]
pub extern "C" fn baton_self() -> BatonThread {
    default_scheduler()
        .try_current()
        .map_or(BATON_NO_THREAD, ThreadId::as_usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    unsafe extern "C-unwind" fn double_arg(arg: *mut c_void) -> c_int {
        baton_yield();
        (arg as usize as c_int) * 2
    }

    unsafe extern "C-unwind" fn exit_with_arg(arg: *mut c_void) -> c_int {
        baton_yield();
        baton_exit(arg as usize as c_int)
    }

    unsafe extern "C-unwind" fn report_self(_arg: *mut c_void) -> c_int {
        baton_self() as c_int
    }

    #[test]
    fn test_create_and_join() {
        let mut id: BatonThread = BATON_NO_THREAD;
        let mut status: c_int = 0;
        unsafe {
            assert_eq!(baton_create(&mut id, ptr::null(), Some(double_arg), 21 as *mut c_void), BATON_OK);
            assert_ne!(id, BATON_NO_THREAD);
            assert_eq!(baton_join(id, &mut status), BATON_OK);
        }
        assert_eq!(status, 42);
    }

    #[test]
    fn test_exit_from_entry() {
        let mut id: BatonThread = 0;
        let mut status: c_int = 0;
        unsafe {
            assert_eq!(baton_create(&mut id, ptr::null(), Some(exit_with_arg), 9 as *mut c_void), BATON_OK);
            assert_eq!(baton_join(id, &mut status), BATON_OK);
        }
        assert_eq!(status, 9);
    }

    #[test]
    fn test_self_inside_thread() {
        let mut id: BatonThread = 0;
        let mut status: c_int = -1;
        let attr = BatonAttr { priority: 3, policy: 1, stack_size: 128 * 1024 };
        unsafe {
            assert_eq!(baton_create(&mut id, &attr, Some(report_self), ptr::null_mut()), BATON_OK);
            assert_eq!(baton_join(id, &mut status), BATON_OK);
        }
        assert_eq!(status as usize, id);

        let attrs = default_scheduler().attributes(ThreadId::new(id)).unwrap();
        assert_eq!(attrs.priority, 3);
        assert_eq!(attrs.policy, SchedPolicy::RoundRobin);
        assert_eq!(attrs.stack_size, Some(128 * 1024));
    }

    #[test]
    fn test_invalid_arguments() {
        let mut id: BatonThread = 0;
        let bad_attr = BatonAttr { priority: 0, policy: 9, stack_size: 0 };
        unsafe {
            assert_eq!(baton_create(&mut id, ptr::null(), None, ptr::null_mut()), BATON_EINVAL);
            assert_eq!(
                baton_create(&mut id, &bad_attr, Some(double_arg), ptr::null_mut()),
                BATON_EINVAL
            );
            assert_eq!(baton_join(1_000_000, ptr::null_mut()), -1);
        }
        assert_eq!(baton_yield(), BATON_EINVAL);
    }
}
