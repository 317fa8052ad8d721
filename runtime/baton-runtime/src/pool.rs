//!
//! Thread Control Block Pool
//!
//! A fixed-capacity arena of thread control blocks. Slot `n` holds the TCB
//! whose id is `n`; slots are handed out by a monotonically increasing
//! counter and are never reused, so ids stay stable for the lifetime of the
//! scheduler.
//!
//! Queue linkage does not live here: the ready queue keeps its own
//! `next`/`prev` index table under its lock.
//!

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;

use baton_std_sync::{BinarySemaphore, Latch};

use crate::errors::ThreadError;

/// Value a logical thread finishes with.
pub type ExitCode = i32;

/// Body of a logical thread. The closure captures what C code would pass as
/// the opaque argument.
pub type Entry = Box<dyn FnOnce() -> ExitCode + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<ThreadId> for usize {
    fn from(id: ThreadId) -> usize {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Holds the baton.
    Running = 0,
    /// Linked in the ready queue, waiting for the baton.
    Ready = 1,
    /// Parked in a cooperative join.
    Blocked = 2,
    Exited = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Running,
            1 => ThreadState::Ready,
            2 => ThreadState::Blocked,
            _ => ThreadState::Exited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Cooperative,
    RoundRobin,
    Fifo,
}

/// Creation attributes. Priority and policy are recorded but do not affect
/// scheduling order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadAttributes {
    pub name: Option<String>,
    pub priority: i32,
    pub policy: SchedPolicy,
    /// Backing stack size in bytes; `None` uses the scheduler's `stack_size`.
    pub stack_size: Option<usize>,
}

impl ThreadAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Idle,
    Application,
}

pub struct Tcb {
    id: ThreadId,
    kind: ThreadKind,
    attrs: ThreadAttributes,
    state: AtomicU8,
    stack_size: usize,
    pub(crate) baton: BinarySemaphore,
    pub(crate) exited: Latch<ExitCode>,
    entry: Mutex<Option<Entry>>,
    backing: Mutex<Option<JoinHandle<()>>>,
}

impl Tcb {
    pub(crate) fn new(
        id: ThreadId,
        kind: ThreadKind,
        attrs: ThreadAttributes,
        stack_size: usize,
        entry: Option<Entry>,
    ) -> Self {
        // the idle thread owns the baton from the start
        let baton = match kind {
            ThreadKind::Idle => BinarySemaphore::new(1),
            ThreadKind::Application => BinarySemaphore::new(0),
        };
        Self {
            id,
            kind,
            attrs,
            state: AtomicU8::new(ThreadState::Ready as u8),
            stack_size,
            baton,
            exited: Latch::new(),
            entry: Mutex::new(entry),
            backing: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn attrs(&self) -> &ThreadAttributes {
        &self.attrs
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exited.get()
    }

    /// Marks the TCB exited and releases every joiner.
    pub(crate) fn record_exit(&self, code: ExitCode) {
        self.set_state(ThreadState::Exited);
        self.exited.set(code);
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn attach_backing(&self, handle: JoinHandle<()>) {
        *self.backing.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_backing(&self) -> Option<JoinHandle<()>> {
        self.backing.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("baton", &self.baton)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

pub struct Pool {
    slots: Box<[OnceLock<Arc<Tcb>>]>,
    len: AtomicUsize,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of published slots.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next `publish` must use. Callers serialize allocation, so
    /// reserving and publishing are separate steps: a slot whose backing
    /// thread fails to spawn is simply never published.
    pub fn next_id(&self) -> Result<ThreadId, ThreadError> {
        let next = self.len();
        if next >= self.capacity() {
            return Err(ThreadError::CapacityExceeded {
                capacity: self.capacity(),
            });
        }
        Ok(ThreadId(next))
    }

    pub fn publish(&self, tcb: Arc<Tcb>) {
        let index = tcb.id().as_usize();
        assert_eq!(index, self.len(), "pool slots must be published in order");
        if self.slots[index].set(tcb).is_err() {
            panic!("pool slot {} published twice", index);
        }
        self.len.store(index + 1, Ordering::Release);
    }

    pub fn get(&self, id: ThreadId) -> Option<&Arc<Tcb>> {
        self.slots.get(id.as_usize()).and_then(OnceLock::get)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tcb>> {
        self.slots[..self.len()].iter().filter_map(OnceLock::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_tcb(id: usize) -> Arc<Tcb> {
        Arc::new(Tcb::new(
            ThreadId(id),
            ThreadKind::Application,
            ThreadAttributes::default(),
            64 * 1024,
            Some(Box::new(|| 0)),
        ))
    }

    #[test]
    fn test_publish_in_order() {
        let pool = Pool::new(3);
        assert!(pool.is_empty());

        let id = pool.next_id().unwrap();
        assert_eq!(id, ThreadId(0));
        pool.publish(app_tcb(0));

        assert_eq!(pool.next_id().unwrap(), ThreadId(1));
        pool.publish(app_tcb(1));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(ThreadId(1)).unwrap().id(), ThreadId(1));
        assert!(pool.get(ThreadId(2)).is_none());
        assert!(pool.get(ThreadId(99)).is_none());
        assert_eq!(pool.iter().count(), 2);
    }

    #[test]
    fn test_capacity_exceeded() {
        let pool = Pool::new(2);
        pool.publish(app_tcb(0));
        pool.publish(app_tcb(1));

        match pool.next_id() {
            Err(ThreadError::CapacityExceeded { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "published in order")]
    fn test_publish_out_of_order_panics() {
        let pool = Pool::new(4);
        pool.publish(app_tcb(2));
    }

    #[test]
    fn test_tcb_initial_state() {
        let idle = Tcb::new(ThreadId(0), ThreadKind::Idle, ThreadAttributes::default(), 65536, None);
        assert!(idle.baton.is_signaled());
        assert_eq!(idle.state(), ThreadState::Ready);

        let app = app_tcb(1);
        assert!(!app.baton.is_signaled());
        assert!(app.take_entry().is_some());
        assert!(app.take_entry().is_none());
    }

    #[test]
    fn test_record_exit() {
        let tcb = app_tcb(3);
        assert_eq!(tcb.exit_code(), None);
        tcb.record_exit(42);
        assert_eq!(tcb.state(), ThreadState::Exited);
        assert_eq!(tcb.exit_code(), Some(42));
        assert_eq!(tcb.exited.wait(), 42);
    }

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId::new(7).to_string(), "#7");
        assert_eq!(usize::from(ThreadId::new(7)), 7);
    }
}
