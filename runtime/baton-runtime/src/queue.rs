//!
//! Ready Queue
//!
//! A circular doubly-linked list of thread ids threaded through an index
//! table sized to the pool's capacity. `head` is the thread entitled to run.
//! Every structural change happens under a single lock that is held only for
//! the O(1) link update, never across a baton wait.
//!

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::pool::ThreadId;

const UNLINKED: usize = usize::MAX;

#[derive(Debug)]
struct Links {
    head: Option<usize>,
    next: Vec<usize>,
    prev: Vec<usize>,
    len: usize,
}

impl Links {
    fn is_linked(&self, index: usize) -> bool {
        self.next[index] != UNLINKED
    }

    fn insert_at_tail(&mut self, index: usize) {
        assert!(!self.is_linked(index), "thread #{} is already queued", index);
        match self.head {
            None => {
                self.head = Some(index);
                self.next[index] = index;
                self.prev[index] = index;
            }
            Some(head) => {
                let tail = self.prev[head];
                self.prev[index] = tail;
                self.next[tail] = index;
                self.prev[head] = index;
                self.next[index] = head;
            }
        }
        self.len += 1;
    }

    /// Returns the head after checking it is `expected`, or `None` if the
    /// queue is empty.
    fn expect_head(&self, expected: usize, op: &str) -> Option<usize> {
        match self.head {
            Some(head) if head != expected => panic!(
                "{} called by thread #{} but the queue head is #{}",
                op, expected, head
            ),
            head => head,
        }
    }

    fn advance_head(&mut self, expected: usize) -> Option<usize> {
        let head = self.expect_head(expected, "advance_head")?;
        let next = self.next[head];
        self.head = Some(next);
        Some(next)
    }

    fn remove_head(&mut self, expected: usize) -> Option<usize> {
        let head = self.expect_head(expected, "remove_head")?;
        let next = self.next[head];
        if next == head {
            self.head = None;
        } else {
            let prev = self.prev[head];
            self.next[prev] = next;
            self.prev[next] = prev;
            self.head = Some(next);
        }
        self.next[head] = UNLINKED;
        self.prev[head] = UNLINKED;
        self.len -= 1;
        self.head
    }

    fn members(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(head) = self.head {
            let mut cursor = head;
            loop {
                out.push(cursor);
                cursor = self.next[cursor];
                if cursor == head || out.len() > self.len {
                    break;
                }
            }
        }
        out
    }

    fn is_well_formed(&self) -> bool {
        let Some(head) = self.head else {
            return self.len == 0 && self.next.iter().all(|&n| n == UNLINKED);
        };

        let mut seen = 0;
        let mut cursor = head;
        loop {
            let next = self.next[cursor];
            if next == UNLINKED || self.prev[next] != cursor {
                return false;
            }
            seen += 1;
            cursor = next;
            if cursor == head || seen > self.len {
                break;
            }
        }

        // the walk must close exactly at `len` members, and nothing outside
        // the cycle may claim to be linked
        let linked = self.next.iter().filter(|&&n| n != UNLINKED).count();
        cursor == head && seen == self.len && linked == self.len
    }
}

pub struct ReadyQueue {
    links: Mutex<Links>,
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: Mutex::new(Links {
                head: None,
                next: vec![UNLINKED; capacity],
                prev: vec![UNLINKED; capacity],
                len: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Links `id` behind the current tail. An empty queue makes it the head.
    pub fn insert_at_tail(&self, id: ThreadId) {
        self.lock().insert_at_tail(id.as_usize());
    }

    /// Moves the head one step forward and returns the new head. No-op on an
    /// empty queue.
    ///
    /// Panics if the queue has a head other than `current`: only the baton
    /// holder may move it.
    pub fn advance_head(&self, current: ThreadId) -> Option<ThreadId> {
        self.lock().advance_head(current.as_usize()).map(ThreadId::new)
    }

    /// Unlinks the head and returns the new head, or `None` if the queue is
    /// now empty. No-op on an empty queue.
    ///
    /// Panics if the queue has a head other than `current`.
    pub fn remove_head(&self, current: ThreadId) -> Option<ThreadId> {
        self.lock()
            .remove_head(current.as_usize())
            .map(ThreadId::new)
    }

    pub fn head(&self) -> Option<ThreadId> {
        self.lock().head.map(ThreadId::new)
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        let links = self.lock();
        links
            .next
            .get(id.as_usize())
            .is_some_and(|&n| n != UNLINKED)
    }

    /// Queue members in scheduling order, starting from the head.
    pub fn members(&self) -> Vec<ThreadId> {
        self.lock().members().into_iter().map(ThreadId::new).collect()
    }

    pub fn is_well_formed(&self) -> bool {
        self.lock().is_well_formed()
    }
}
