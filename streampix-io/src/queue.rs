//! Bounded buffer queue between the network producer and the framer.
//!
//! Flow control is drop-oldest: when the queue is at capacity the oldest
//! buffer is evicted and counted, keeping the producer non-blocking. An
//! elevated drop count means the framer cannot keep up with the stream.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct QueueState {
    buffers: VecDeque<Vec<u8>>,
    dropped: u64,
    stopped: bool,
}

/// Bounded FIFO of owned byte buffers with one producer and one consumer.
pub struct BufferQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl BufferQueue {
    /// Default queue depth.
    pub const DEFAULT_CAPACITY: usize = 2000;

    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffers: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
                stopped: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies `data` into an owned buffer and enqueues it, evicting the
    /// oldest buffer when full.
    pub fn push(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        if state.buffers.len() >= self.capacity {
            state.buffers.pop_front();
            state.dropped += 1;
        }
        state.buffers.push_back(data.to_vec());
        drop(state);
        self.available.notify_one();
    }

    /// Dequeues the oldest buffer, waiting up to `timeout`.
    ///
    /// Returns `None` when the wait times out or the queue is stopped and
    /// drained; check [`is_finished`](Self::is_finished) to distinguish.
    pub fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if let Some(buffer) = state.buffers.pop_front() {
                return Some(buffer);
            }
            if state.stopped {
                return None;
            }
            let (next, result) = self
                .available
                .wait_timeout(state, timeout)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if result.timed_out() {
                return state.buffers.pop_front();
            }
        }
    }

    /// Marks the queue stopped and wakes any waiting consumer. Already
    /// queued buffers remain poppable.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// True once the queue is stopped and fully drained.
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.stopped && state.buffers.is_empty()
    }

    /// Approximate number of queued buffers.
    pub fn len(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffers.is_empty()
    }

    /// Buffers evicted under backpressure so far.
    pub fn dropped_buffers(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_push_pop_fifo() {
        let queue = BufferQueue::new(4);
        queue.push(&[1, 2]);
        queue.push(&[3]);
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(vec![1, 2]));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(vec![3]));
        assert_eq!(queue.pop(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = BufferQueue::new(2);
        queue.push(&[1]);
        queue.push(&[2]);
        queue.push(&[3]);
        assert_eq!(queue.dropped_buffers(), 1);
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(vec![2]));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(vec![3]));
    }

    #[test]
    fn test_stop_wakes_consumer() {
        let queue = Arc::new(BufferQueue::new(4));
        let consumer_queue = queue.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let buffer = consumer_queue.pop(Duration::from_secs(5));
            (buffer, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        queue.stop();
        let (buffer, waited) = handle.join().unwrap();
        assert_eq!(buffer, None);
        assert!(waited < Duration::from_secs(2));
        assert!(queue.is_finished());
    }

    #[test]
    fn test_drain_after_stop() {
        let queue = BufferQueue::new(4);
        queue.push(&[7]);
        queue.stop();
        assert!(!queue.is_finished());
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(vec![7]));
        assert!(queue.is_finished());
    }

    #[test]
    fn test_push_after_stop_ignored() {
        let queue = BufferQueue::new(4);
        queue.stop();
        queue.push(&[1]);
        assert!(queue.is_empty());
    }
}
