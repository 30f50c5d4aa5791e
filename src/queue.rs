//! BoundedEventQueue (C2): fixed-capacity FIFO with a non-blocking producer
//! and a blocking, cancellation-safe consumer.
//!
//! Grounded directly on `LogEventQueue`: a `mutex` + `condition_variable`
//! guarding a plain `VecDeque`, where `push` checks capacity before
//! enqueueing and `wait_pop` waits on the predicate "queue not empty".

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::event::EventRecord;

/// Outcome of a [`BoundedEventQueue::push`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Accepted,
    /// The queue was full; `ev` was returned to the caller untouched so
    /// diagnostics can inspect the timestamp that would have been evicted.
    Rejected { oldest_elapsed_ns: i64 },
}

struct Inner {
    queue: VecDeque<EventRecord>,
    closed: bool,
}

/// Thread-safe FIFO of capacity `K`. Supports exactly one concurrent consumer;
/// behavior with multiple concurrent `wait_pop` callers is unspecified, same
/// as the source.
pub struct BoundedEventQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl BoundedEventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "queue capacity must be positive");
        Arc::new(Self {
            capacity,
            inner: Mutex::new(Inner { queue: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Condvar::new(),
        })
    }

    /// Never blocks. Returns `Rejected` without consuming `ev` if the queue is
    /// already at capacity. Notifies at most one waiter on `Accepted`.
    pub fn push(&self, ev: EventRecord) -> PushResult {
        let mut guard = self.inner.lock();
        if guard.queue.len() >= self.capacity {
            let oldest_elapsed_ns = guard
                .queue
                .front()
                .map(|e| e.elapsed_ns())
                .unwrap_or(ev.elapsed_ns());
            return PushResult::Rejected { oldest_elapsed_ns };
        }
        guard.queue.push_back(ev);
        drop(guard);
        self.not_empty.notify_one();
        PushResult::Accepted
    }

    /// Blocks until an element is available or the queue is closed. Returns
    /// `None` only after [`Self::close`] has been called and the queue has
    /// fully drained — the cancellation-safe sentinel the consumer loop uses
    /// to terminate.
    pub fn wait_pop(&self) -> Option<EventRecord> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(ev) = guard.queue.pop_front() {
                return Some(ev);
            }
            if guard.closed {
                return None;
            }
            self.not_empty.wait(&mut guard);
        }
    }

    /// Advisory, non-locking-equivalent read: takes the lock briefly but does
    /// not participate in the wait/notify protocol.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals the consumer's cancellation token: wakes a blocked `wait_pop`
    /// so it can drain the remainder and return `None` once empty.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FieldValue;
    use std::thread;
    use std::time::Duration;

    fn rec(elapsed_ns: i64) -> EventRecord {
        EventRecord::new(1, 0, 0, elapsed_ns, elapsed_ns, vec![FieldValue::Bool(true)])
    }

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedEventQueue::new(10);
        for ts in [100, 200, 300] {
            assert_eq!(q.push(rec(ts)), PushResult::Accepted);
        }
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 100);
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 200);
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 300);
    }

    #[test]
    fn overflow_reports_oldest_timestamp() {
        // Scenario 1 from the testable-properties section: capacity 3,
        // pushes 100/200/300/400; the fourth push is rejected with 100.
        let q = BoundedEventQueue::new(3);
        assert_eq!(q.push(rec(100)), PushResult::Accepted);
        assert_eq!(q.push(rec(200)), PushResult::Accepted);
        assert_eq!(q.push(rec(300)), PushResult::Accepted);
        assert_eq!(q.push(rec(400)), PushResult::Rejected { oldest_elapsed_ns: 100 });
        assert_eq!(q.len(), 3);
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 100);
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 200);
        assert_eq!(q.wait_pop().unwrap().elapsed_ns(), 300);
    }

    #[test]
    fn wait_pop_blocks_until_pushed() {
        let q = BoundedEventQueue::new(4);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_pop());
        thread::sleep(Duration::from_millis(20));
        q.push(rec(42));
        let got = handle.join().unwrap();
        assert_eq!(got.unwrap().elapsed_ns(), 42);
    }

    #[test]
    fn close_unblocks_waiting_consumer() {
        let q = BoundedEventQueue::new(4);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_pop());
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(handle.join().unwrap().is_none());
    }
}
