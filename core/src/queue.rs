//! # Work Queues
//!
//! Two fixed-capacity FIFOs, one for reclaim requests and one for swap-in
//! requests. Each queue is guarded by a single lock held only for the O(1)
//! push or pop, and wakes its daemon after every accepted item.

use heapless::Deque;
use memplus_hal::Pid;
use spin::Mutex;

use crate::config::QUEUE_CAPACITY;
use crate::daemon::Waker;

/// A queued request for one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// Target process
    pub pid: Pid,
    /// Priority tier before the change that created this item
    pub previous_tier: i32,
    /// Request ticket; the item is dead once the record's ticket moves on
    pub ticket: u64,
}

/// Bounded FIFO of [`WorkItem`]s
#[derive(Debug)]
pub struct WorkQueue {
    name: &'static str,
    items: Mutex<Deque<WorkItem, QUEUE_CAPACITY>>,
    waker: Waker,
}

impl WorkQueue {
    /// Create an empty queue
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(Deque::new()),
            waker: Waker::new(),
        }
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item
    ///
    /// Returns `false` without touching the queue when it is full.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        let mut items = self.items.lock();
        if items.push_back(item).is_err() {
            log::debug!("{}: full, dropping item for pid {}", self.name, item.pid);
            return false;
        }
        assert!(items.len() <= QUEUE_CAPACITY);
        drop(items);

        self.waker.wake();
        true
    }

    /// Pop the oldest item
    pub fn dequeue(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    /// Number of queued items matching `pred`
    pub fn count_where(&self, pred: impl Fn(&WorkItem) -> bool) -> usize {
        self.items.lock().iter().filter(|item| pred(item)).count()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Fixed capacity
    pub const fn capacity(&self) -> usize {
        QUEUE_CAPACITY
    }

    /// Wake handle of the owning daemon
    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }
}
