//! Priority request queue with deadline eviction.
//!
//! Ordering is `(priority desc, arrival asc)`; retried items re-enter at
//! the head of their priority band. Items whose deadline has passed are
//! evicted before dispatch and never reach a connection.

use crate::error::MuxError;
use crate::types::{RagRequest, RagResponse};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// One queued request awaiting dispatch.
pub struct QueueItem {
    pub id: String,
    pub request: RagRequest,
    pub priority: i32,
    /// Arrival order within a priority band; lower dispatches first.
    pub seq: i64,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub retry_count: u32,
    pub responder: oneshot::Sender<Result<RagResponse, MuxError>>,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl QueueItem {
    /// Resolve the caller. A dropped receiver is not an error.
    pub fn complete(self, result: Result<RagResponse, MuxError>) {
        let _ = self.responder.send(result);
    }
}

/// Bounded priority queue.
#[derive(Debug)]
pub struct RequestQueue {
    items: Mutex<Vec<QueueItem>>,
    capacity: usize,
    accepting: AtomicBool,
    tail_seq: AtomicI64,
    head_seq: AtomicI64,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            accepting: AtomicBool::new(true),
            tail_seq: AtomicI64::new(0),
            head_seq: AtomicI64::new(-1),
        }
    }

    /// Append a new item. Rejects when closed or full.
    pub fn enqueue(&self, mut item: QueueItem) -> Result<(), QueueItem> {
        item.seq = self.tail_seq.fetch_add(1, Ordering::Relaxed);
        self.push(item)
    }

    /// Re-enter a retried item ahead of everything at its priority.
    pub fn requeue_front(&self, mut item: QueueItem) -> Result<(), QueueItem> {
        item.seq = self.head_seq.fetch_sub(1, Ordering::Relaxed);
        self.push(item)
    }

    fn push(&self, item: QueueItem) -> Result<(), QueueItem> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(item);
        }
        let mut items = self.items.lock().expect("queue lock poisoned");
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push(item);
        Ok(())
    }

    /// Remove and return every item whose deadline has passed.
    pub fn take_expired(&self, now: Instant) -> Vec<QueueItem> {
        let mut items = self.items.lock().expect("queue lock poisoned");
        let mut expired = Vec::new();
        let mut i = 0;
        while i < items.len() {
            if matches!(items[i].deadline, Some(d) if d <= now) {
                expired.push(items.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }

    /// Take up to `max` items in dispatch order.
    pub fn pop_ready(&self, max: usize) -> Vec<QueueItem> {
        if max == 0 {
            return Vec::new();
        }
        let mut items = self.items.lock().expect("queue lock poisoned");
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    /// Stop accepting new items.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Remove everything still queued (used on shutdown).
    pub fn drain_all(&self) -> Vec<QueueItem> {
        std::mem::take(&mut *self.items.lock().expect("queue lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `min(1, len/capacity)`.
    pub fn backpressure_level(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64).min(1.0)
    }
}
