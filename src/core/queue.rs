//! In-memory priority queue for deferred work.
//!
//! Entries are ordered by priority (lowest value first) and then by insertion
//! sequence, so equal priorities come out FIFO. The queue knows nothing about
//! what it holds and never drops an entry; backpressure is the caller's job.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Mutex, MutexGuard};

/// A queued item with its ordering keys.
#[derive(Debug, Clone)]
pub struct QueueEntry<T> {
    pub item: T,
    pub priority: u32,
    pub sequence: u64,
}

// BinaryHeap is a max-heap, so the comparison is reversed: the entry with the
// lowest (priority, sequence) pair compares greatest.
impl<T> Ord for QueueEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueueEntry<T> {}

struct Inner<T> {
    heap: BinaryHeap<QueueEntry<T>>,
    next_sequence: u64,
}

/// Thread-safe priority queue.
pub struct PriorityQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // The heap is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an item. Returns the sequence number assigned to it.
    pub fn enqueue(&self, item: T, priority: u32) -> u64 {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(QueueEntry {
            item,
            priority,
            sequence,
        });
        sequence
    }

    /// Remove the entry with the lowest priority value, oldest first.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_entry().map(|entry| entry.item)
    }

    /// Like [`dequeue`](Self::dequeue) but keeps the ordering keys.
    pub fn dequeue_entry(&self) -> Option<QueueEntry<T>> {
        self.lock().heap.pop()
    }

    /// Priority of the entry that would be dequeued next.
    pub fn peek_priority(&self) -> Option<u32> {
        self.lock().heap.peek().map(|entry| entry.priority)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Current size broken down by priority.
    pub fn snapshot(&self) -> QueueStats {
        let inner = self.lock();
        let mut by_priority = BTreeMap::new();
        for entry in inner.heap.iter() {
            *by_priority.entry(entry.priority).or_insert(0) += 1;
        }
        QueueStats {
            len: inner.heap.len(),
            by_priority,
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub by_priority: BTreeMap<u32, usize>,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Queue: {} waiting", self.len)?;
        for (priority, count) in &self.by_priority {
            write!(f, "\n  P{}: {}", priority, count)?;
        }
        Ok(())
    }
}
