//! Bounded Insert Queue
//!
//! FIFO of pending inserts between caller threads and the single insert
//! thread. The bound is on aggregate payload bytes: a push that would take
//! the backlog past its limit fails immediately instead of blocking.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};

use super::key::CacheKey;

/// Items that carry a byte weight for backlog accounting
pub trait Weighted {
    /// Bytes counted against the backlog limit
    fn weight(&self) -> u64;

    /// Control items bypass the backlog limit
    fn is_control(&self) -> bool {
        false
    }
}

/// A pending insert request
#[derive(Debug)]
pub enum InsertOp {
    /// Append `data` under `key`; `reserved` bytes were claimed from capacity
    Insert {
        key: CacheKey,
        data: Bytes,
        reserved: u64,
    },
    /// Flush the partially filled buffer, then acknowledge
    Flush(Sender<()>),
    /// Drain and stop the insert thread
    Exit,
}

impl InsertOp {
    pub fn new(key: CacheKey, data: Bytes, reserved: u64) -> Self {
        InsertOp::Insert {
            key,
            data,
            reserved,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            InsertOp::Insert { key, data, .. } => key.len() + data.len(),
            InsertOp::Flush(_) | InsertOp::Exit => 0,
        }
    }
}

impl Weighted for InsertOp {
    fn weight(&self) -> u64 {
        self.size() as u64
    }

    fn is_control(&self) -> bool {
        !matches!(self, InsertOp::Insert { .. })
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    bytes: u64,
}

/// Byte-bounded, single-consumer FIFO queue
pub struct BoundedQueue<T> {
    max_bytes: u64,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
}

impl<T: Weighted> BoundedQueue<T> {
    /// Create a queue holding at most `max_bytes` of item weight
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                bytes: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue `item`, handing it back if the backlog is full
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let weight = item.weight();
        let mut state = self.state.lock();
        if !item.is_control() && state.bytes + weight > self.max_bytes {
            return Err(item);
        }
        state.bytes += weight;
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, parking while the queue is empty
    pub fn pop_blocking(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.take_front(&mut state) {
                return item;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeue the oldest item, giving up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if let Some(item) = self.take_front(&mut state) {
            return Some(item);
        }
        self.not_empty.wait_for(&mut state, timeout);
        self.take_front(&mut state)
    }

    fn take_front(&self, state: &mut QueueState<T>) -> Option<T> {
        let item = state.items.pop_front()?;
        state.bytes -= item.weight();
        Some(item)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate weight of queued items
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Remove every queued item
    pub fn clear(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.bytes = 0;
        state.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn op(key: &str, size: usize) -> InsertOp {
        InsertOp::new(CacheKey::from(key), Bytes::from(vec![0u8; size]), 0)
    }

    fn key_of(op: &InsertOp) -> String {
        match op {
            InsertOp::Insert { key, .. } => String::from_utf8(key.as_bytes().to_vec()).unwrap(),
            InsertOp::Flush(_) => "flush".to_string(),
            InsertOp::Exit => "exit".to_string(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(1024);
        for k in ["a", "b", "c"] {
            queue.push(op(k, 10)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.size_bytes(), 33);

        let order: Vec<_> = (0..3).map(|_| key_of(&queue.pop_blocking())).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.size_bytes(), 0);
    }

    #[test]
    fn test_push_fails_when_backlog_full() {
        let queue = BoundedQueue::new(100);
        queue.push(op("a", 59)).unwrap();
        let rejected = queue.push(op("b", 60)).unwrap_err();
        assert_eq!(key_of(&rejected), "b");
        assert_eq!(queue.len(), 1);

        // An op bigger than the whole backlog never fits
        let empty = BoundedQueue::new(10);
        assert!(empty.push(op("big", 64)).is_err());
    }

    #[test]
    fn test_exit_bypasses_bound() {
        let queue = BoundedQueue::new(10);
        queue.push(op("a", 9)).unwrap();
        assert!(queue.push(op("b", 9)).is_err());
        queue.push(InsertOp::Exit).unwrap();

        assert_eq!(key_of(&queue.pop_blocking()), "a");
        assert!(matches!(queue.pop_blocking(), InsertOp::Exit));
    }

    #[test]
    fn test_pop_blocking_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(1024));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || key_of(&queue.pop_blocking()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(op("late", 1)).unwrap();
        assert_eq!(consumer.join().unwrap(), "late");
    }

    #[test]
    fn test_pop_timeout_on_empty_queue() {
        let queue: BoundedQueue<InsertOp> = BoundedQueue::new(1024);
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
    }
}
