//!
//! Cooperative Scheduler for baton
//!
//! Runs every logical thread on its own backing OS thread, but lets only one
//! of them execute application code at a time. Each thread control block owns
//! a binary semaphore (its baton); the thread at the head of the ready queue
//! is the only one whose baton is signaled. Scheduling is a relay:
//!
//! - `yield_now` advances the head, signals the new head, waits on its own baton
//! - `exit` unlinks the caller, signals the new head, records the exit code
//! - `join` waits for a thread's exit latch (or yields until it is set when
//!   called from a scheduled thread)
//!
//! The first `create` also starts the idle thread in slot 0, which keeps the
//! queue non-empty and absorbs turns when no application thread is runnable.
//!

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use baton_std_sync::BinarySemaphore;
use tracing::{debug, error, trace, warn};

use crate::config::{MIN_STACK_SIZE, SchedulerConfig};
use crate::errors::{ConfigError, ThreadError};
use crate::pool::{
    ExitCode, Pool, Tcb, ThreadAttributes, ThreadId, ThreadKind, ThreadState,
};
use crate::queue::ReadyQueue;

/// Slot of the idle thread.
pub const IDLE_THREAD: ThreadId = ThreadId::new(0);

/// Exit code recorded for a thread whose entry panicked.
pub const PANIC_EXIT_CODE: ExitCode = 101;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (scheduler uid, thread id) of the logical thread backed by this OS thread.
    static CURRENT: Cell<Option<(u64, ThreadId)>> = const { Cell::new(None) };
}

/// Unwind payload carrying the code passed to `Scheduler::exit`.
struct ExitRequest(ExitCode);

/// Point-in-time view of the ready queue. Gathered under several locks, so it
/// is only exact while the scheduler is quiescent or when taken by the thread
/// holding the baton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub head: Option<ThreadId>,
    /// Queue members in scheduling order, starting at `head`.
    pub members: Vec<ThreadId>,
    /// Threads whose baton is currently signaled.
    pub signaled: Vec<ThreadId>,
    pub well_formed: bool,
}

struct Inner {
    uid: u64,
    config: SchedulerConfig,
    pool: Pool,
    queue: ReadyQueue,
    create_lock: Mutex<()>,
    shutdown: AtomicBool,
}

/// Handle to a scheduler instance. Clones share the same pool and queue, so
/// thread bodies typically capture a clone to call `yield_now` and `exit`.
///
/// Dropping the last handle requests shutdown without waiting: the idle
/// thread stops once every application thread has exited.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    _handles: Arc<HandleGuard>,
}

/// Shared by every `Scheduler` clone, but never by backing threads.
struct HandleGuard {
    inner: Arc<Inner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.inner.request_shutdown() {
            debug!(uid = self.inner.uid, "last scheduler handle dropped");
        }
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Inner {
            uid: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            pool: Pool::new(config.capacity),
            queue: ReadyQueue::new(config.capacity),
            create_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            config,
        };
        let inner = Arc::new(inner);
        Ok(Self {
            _handles: Arc::new(HandleGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Slots handed out so far, including the idle thread.
    pub fn thread_count(&self) -> usize {
        self.inner.pool.len()
    }

    /// Creates a logical thread that runs `entry` once it is first scheduled.
    ///
    /// The thread is linked at the tail of the ready queue, so it runs after
    /// every thread already queued. Callable from any context, including a
    /// running logical thread.
    pub fn create<F>(&self, attrs: &ThreadAttributes, entry: F) -> Result<ThreadId, ThreadError>
    where
        F: FnOnce() -> ExitCode + Send + 'static,
    {
        let inner = &self.inner;
        let _guard = inner.create_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.shutdown.load(Ordering::Acquire) {
            warn!("create rejected: scheduler is shut down");
            return Err(ThreadError::ShutDown);
        }

        if inner.pool.is_empty() {
            inner.bootstrap()?;
        }

        let id = inner.pool.next_id().inspect_err(|_| {
            warn!(capacity = inner.pool.capacity(), "create rejected: thread pool exhausted");
        })?;
        let stack_size = attrs
            .stack_size
            .map_or(inner.config.stack_size, |size| size.max(MIN_STACK_SIZE));
        let tcb = Arc::new(Tcb::new(
            id,
            ThreadKind::Application,
            attrs.clone(),
            stack_size,
            Some(Box::new(entry)),
        ));

        let handle = {
            let inner = Arc::clone(inner);
            let worker = Arc::clone(&tcb);
            self.inner.spawn_backing(&tcb, move || inner.run_thread(&worker))?
        };
        tcb.attach_backing(handle);

        inner.pool.publish(tcb);
        inner.queue.insert_at_tail(id);
        debug!(thread = %id, name = ?attrs.name, "thread created");
        Ok(id)
    }

    /// `create` with default attributes.
    pub fn spawn<F>(&self, entry: F) -> Result<ThreadId, ThreadError>
    where
        F: FnOnce() -> ExitCode + Send + 'static,
    {
        self.create(&ThreadAttributes::default(), entry)
    }

    /// Passes the baton to the next thread in the queue and waits for it to
    /// come back around.
    ///
    /// Panics when called from outside a thread run by this scheduler.
    pub fn yield_now(&self) {
        let tcb = self.inner.current_tcb("yield_now");
        self.inner.pass_baton(tcb, ThreadState::Ready);
    }

    /// Ends the calling logical thread with `code`.
    ///
    /// The caller's stack is unwound back to its thread wrapper, so
    /// destructors run before the baton is handed on. An entry that catches
    /// unwinds with `catch_unwind` will intercept the exit.
    ///
    /// Guards are dropped while the thread is unwinding, so a `std::sync::Mutex`
    /// locked across `exit` is left poisoned. Release locks before exiting, or
    /// recover them with `PoisonError::into_inner`.
    ///
    /// Panics when called from outside a thread run by this scheduler.
    pub fn exit(&self, code: ExitCode) -> ! {
        let tcb = self.inner.current_tcb("exit");
        trace!(thread = %tcb.id(), code, "exit requested");
        panic::resume_unwind(Box::new(ExitRequest(code)))
    }

    /// Id of the calling logical thread, or of the queue head when called from
    /// a context this scheduler does not run. `None` before the first `create`
    /// or after shutdown.
    pub fn try_current(&self) -> Option<ThreadId> {
        self.inner.current_id().or_else(|| self.inner.queue.head())
    }

    /// Whether the caller is a logical thread of this scheduler.
    pub fn is_scheduled(&self) -> bool {
        self.inner.current_id().is_some()
    }

    /// Like `try_current`, but panics if the queue is empty.
    pub fn current(&self) -> ThreadId {
        self.try_current()
            .unwrap_or_else(|| panic!("current() called with an empty ready queue"))
    }

    /// Waits for thread `id` to exit and returns its exit code.
    ///
    /// From a plain OS thread this blocks on the target's exit latch. From a
    /// scheduled thread it keeps passing the baton, parked as `Blocked`, until
    /// the target has exited.
    pub fn join(&self, id: ThreadId) -> Result<ExitCode, ThreadError> {
        let target = match self.inner.pool.get(id) {
            Some(tcb) if tcb.kind() == ThreadKind::Application => tcb,
            _ => return Err(ThreadError::NoSuchThread { id }),
        };

        match self.inner.current_id() {
            Some(me) if me == id => Err(ThreadError::JoinSelf { id }),
            Some(me) => {
                let me = self.inner.tcb(me);
                debug!(thread = %me.id(), target = %id, "cooperative join");
                loop {
                    if let Some(code) = target.exit_code() {
                        return Ok(code);
                    }
                    self.inner.pass_baton(me, ThreadState::Blocked);
                }
            }
            None => Ok(target.exited.wait()),
        }
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.inner.pool.get(id).map(|tcb| tcb.state())
    }

    pub fn attributes(&self, id: ThreadId) -> Option<ThreadAttributes> {
        self.inner.pool.get(id).map(|tcb| tcb.attrs().clone())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let members = self.inner.queue.members();
        let signaled = self
            .inner
            .pool
            .iter()
            .filter(|tcb| tcb.baton.is_signaled())
            .map(|tcb| tcb.id())
            .collect();
        QueueSnapshot {
            head: members.first().copied(),
            members,
            signaled,
            well_formed: self.inner.queue.is_well_formed(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Rejects further `create` calls and waits for every backing OS thread
    /// to finish. Application threads finish when they exit; the idle thread
    /// stops once it is the last member of the queue, so this blocks until
    /// all application threads have exited.
    ///
    /// Panics when called from a thread run by this scheduler.
    pub fn shutdown(&self) {
        assert!(
            self.inner.current_id().is_none(),
            "shutdown called from a scheduled thread"
        );
        self.inner.request_shutdown();
        debug!(threads = self.inner.pool.len(), "shutdown requested");

        for tcb in self.inner.pool.iter() {
            if let Some(handle) = tcb.take_backing() {
                if handle.join().is_err() {
                    warn!(thread = %tcb.id(), "backing thread terminated abnormally");
                }
            }
        }
        debug!("shutdown complete");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("uid", &self.inner.uid)
            .field("threads", &self.inner.pool.len())
            .field("capacity", &self.inner.pool.capacity())
            .field("queue", &self.inner.queue.members())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Inner {
    /// Sets the shutdown flag under the create lock, so no insert can race
    /// the idle thread leaving the queue. Returns `false` if already set.
    fn request_shutdown(&self) -> bool {
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    fn current_id(&self) -> Option<ThreadId> {
        match CURRENT.with(Cell::get) {
            Some((uid, id)) if uid == self.uid => Some(id),
            _ => None,
        }
    }

    fn current_tcb(&self, op: &str) -> &Arc<Tcb> {
        match self.current_id() {
            Some(id) => self.tcb(id),
            None => panic!("{} called outside a thread run by this scheduler", op),
        }
    }

    fn tcb(&self, id: ThreadId) -> &Arc<Tcb> {
        self.pool
            .get(id)
            .unwrap_or_else(|| panic!("thread {} has no control block", id))
    }

    fn baton_of(&self, id: ThreadId) -> &BinarySemaphore {
        &self.tcb(id).baton
    }

    fn spawn_backing<F>(&self, tcb: &Tcb, body: F) -> Result<JoinHandle<()>, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = match &tcb.attrs().name {
            Some(name) => format!("{}-{}", self.config.thread_name_prefix, name),
            None => format!("{}-{}", self.config.thread_name_prefix, tcb.id().as_usize()),
        };
        thread::Builder::new()
            .name(name)
            .stack_size(tcb.stack_size())
            .spawn(body)
            .map_err(|source| ThreadError::Spawn {
                id: tcb.id(),
                source,
            })
    }

    /// Starts the idle thread in slot 0. Its baton starts signaled, so it is
    /// the first holder.
    fn bootstrap(self: &Arc<Self>) -> Result<(), ThreadError> {
        let id = self.pool.next_id()?;
        debug_assert_eq!(id, IDLE_THREAD);

        let tcb = Arc::new(Tcb::new(
            id,
            ThreadKind::Idle,
            ThreadAttributes::named("idle"),
            self.config.stack_size,
            None,
        ));
        let handle = {
            let inner = Arc::clone(self);
            let idle = Arc::clone(&tcb);
            self.spawn_backing(&tcb, move || inner.idle_loop(&idle))?
        };
        tcb.attach_backing(handle);

        self.pool.publish(tcb);
        self.queue.insert_at_tail(id);
        debug!(thread = %id, "idle thread started");
        Ok(())
    }

    /// Advances the queue, wakes the new head and parks the caller until its
    /// baton is signaled again.
    fn pass_baton(&self, tcb: &Tcb, parked: ThreadState) {
        let next = self
            .queue
            .advance_head(tcb.id())
            .unwrap_or_else(|| panic!("thread {} passed the baton on an empty ready queue", tcb.id()));
        tcb.set_state(parked);
        trace!(from = %tcb.id(), to = %next, "baton passed");
        self.baton_of(next).up();
        tcb.baton.down();
        tcb.set_state(ThreadState::Running);
    }

    /// Body of every application backing thread.
    fn run_thread(&self, tcb: &Tcb) {
        CURRENT.with(|current| current.set(Some((self.uid, tcb.id()))));

        tcb.baton.down();
        tcb.set_state(ThreadState::Running);
        trace!(thread = %tcb.id(), "first run");

        let code = match tcb.take_entry() {
            Some(entry) => match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(code) => code,
                Err(payload) => match payload.downcast::<ExitRequest>() {
                    Ok(request) => request.0,
                    Err(payload) => {
                        error!(
                            thread = %tcb.id(),
                            reason = panic_message(payload.as_ref()),
                            "thread panicked"
                        );
                        PANIC_EXIT_CODE
                    }
                },
            },
            None => 0,
        };

        self.finish(tcb, code);
        CURRENT.with(|current| current.set(None));
    }

    /// Unlinks the exiting head, hands the baton on and publishes the code.
    fn finish(&self, tcb: &Tcb, code: ExitCode) {
        assert!(
            self.queue.contains(tcb.id()),
            "thread {} exited while not in the ready queue",
            tcb.id()
        );
        let next = self.queue.remove_head(tcb.id());
        if let Some(next) = next {
            self.baton_of(next).up();
        }
        tcb.record_exit(code);
        debug!(thread = %tcb.id(), code, next = ?next, "thread exited");
    }

    /// Body of the idle thread.
    ///
    /// Waits on its baton with a timeout, and only passes the baton on after
    /// actually receiving it. It leaves the queue once shutdown has been
    /// requested and it is the only member left.
    fn idle_loop(&self, tcb: &Tcb) {
        CURRENT.with(|current| current.set(Some((self.uid, tcb.id()))));
        let timeout = self.config.idle_timeout();
        let pause = self.config.idle_pause();

        loop {
            if !tcb.baton.down_timeout(timeout) {
                trace!("idle wait timed out");
                continue;
            }
            tcb.set_state(ThreadState::Running);

            if self.shutdown.load(Ordering::Acquire) && self.queue.len() == 1 {
                self.queue.remove_head(tcb.id());
                tcb.record_exit(0);
                debug!("idle thread stopped");
                break;
            }

            if !pause.is_zero() {
                thread::sleep(pause);
            }

            let next = self
                .queue
                .advance_head(tcb.id())
                .unwrap_or_else(|| panic!("idle thread found an empty ready queue"));
            tcb.set_state(ThreadState::Ready);
            self.baton_of(next).up();
        }

        CURRENT.with(|current| current.set(None));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler(capacity: usize) -> Scheduler {
        let config = SchedulerConfig::default()
            .with_capacity(capacity)
            .with_idle_pause(Duration::from_micros(50));
        Scheduler::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = Scheduler::new(SchedulerConfig::default().with_capacity(1));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_first_create_bootstraps_idle() {
        let sched = scheduler(4);
        assert_eq!(sched.thread_count(), 0);
        assert_eq!(sched.try_current(), None);

        let id = sched.spawn(|| 3).unwrap();
        assert_eq!(id, ThreadId::new(1));
        assert_eq!(sched.thread_count(), 2);
        assert_eq!(sched.attributes(IDLE_THREAD).unwrap().name.as_deref(), Some("idle"));

        assert_eq!(sched.join(id).unwrap(), 3);
        assert_eq!(sched.state(id), Some(ThreadState::Exited));

        sched.shutdown();
        assert_eq!(sched.state(IDLE_THREAD), Some(ThreadState::Exited));
        assert!(sched.snapshot().members.is_empty());
    }

    #[test]
    fn test_join_unknown_and_idle() {
        let sched = scheduler(4);
        assert!(matches!(
            sched.join(ThreadId::new(2)),
            Err(ThreadError::NoSuchThread { .. })
        ));

        let id = sched.spawn(|| 0).unwrap();
        assert!(matches!(
            sched.join(IDLE_THREAD),
            Err(ThreadError::NoSuchThread { .. })
        ));
        assert!(matches!(
            sched.join(ThreadId::new(99)),
            Err(ThreadError::NoSuchThread { .. })
        ));

        sched.join(id).unwrap();
        sched.shutdown();
    }

    #[test]
    fn test_join_self_is_rejected() {
        let sched = scheduler(4);
        let inner = sched.clone();
        let id = sched
            .spawn(move || match inner.join(inner.current()) {
                Err(ThreadError::JoinSelf { .. }) => 1,
                _ => 0,
            })
            .unwrap();
        assert_eq!(sched.join(id).unwrap(), 1);
        sched.shutdown();
    }

    #[test]
    fn test_exit_code_reaches_joiner() {
        let sched = scheduler(4);
        let inner = sched.clone();
        let id = sched
            .spawn(move || {
                inner.yield_now();
                inner.exit(17)
            })
            .unwrap();
        assert_eq!(sched.join(id).unwrap(), 17);
        // joining again returns the same code
        assert_eq!(sched.join(id).unwrap(), 17);
        sched.shutdown();
    }

    #[test]
    fn test_attributes_are_recorded() {
        let sched = scheduler(4);
        let attrs = ThreadAttributes {
            name: Some("worker".to_string()),
            priority: 5,
            policy: crate::pool::SchedPolicy::Fifo,
            stack_size: None,
        };
        let id = sched
            .create(&attrs, || {
                thread::current().name().map_or(0, |n| (n == "baton-worker") as i32)
            })
            .unwrap();
        assert_eq!(sched.join(id).unwrap(), 1);
        assert_eq!(sched.attributes(id), Some(attrs));
        sched.shutdown();
    }

    #[test]
    fn test_dropping_last_handle_stops_idle() {
        let sched = scheduler(4);
        let worker = sched.clone();
        let id = sched
            .spawn(move || {
                worker.yield_now();
                2
            })
            .unwrap();
        assert_eq!(sched.join(id).unwrap(), 2);

        // Once the idle thread leaves its loop nothing holds the shared state.
        let inner = Arc::downgrade(&sched.inner);
        drop(sched);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while inner.strong_count() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "idle thread still running after the last handle was dropped"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_dropping_a_clone_keeps_scheduler_running() {
        let sched = scheduler(4);
        let clone = sched.clone();
        let id = clone.spawn(|| 4).unwrap();
        drop(clone);
        assert!(!sched.is_shut_down());
        assert_eq!(sched.join(id).unwrap(), 4);
        let next = sched.spawn(|| 5).unwrap();
        assert_eq!(sched.join(next).unwrap(), 5);
        sched.shutdown();
        assert_eq!(sched.state(IDLE_THREAD), Some(ThreadState::Exited));
    }

    #[test]
    #[should_panic(expected = "yield_now called outside")]
    fn test_yield_outside_scheduled_thread_panics() {
        scheduler(4).yield_now();
    }

    #[test]
    #[should_panic(expected = "exit called outside")]
    fn test_exit_outside_scheduled_thread_panics() {
        scheduler(4).exit(1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
