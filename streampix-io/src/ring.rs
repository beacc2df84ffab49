//! Lock-free single-producer/single-consumer byte ring.
//!
//! Used by the capture path to decouple the network thread from the disk
//! writer without taking a lock per buffer. Capacity is rounded up to a
//! power of two; head and tail are monotonic 64-bit counters indexed with a
//! mask, and one byte is reserved to distinguish empty from full, so the
//! usable capacity is `capacity() - 1`.
//!
//! Thread contract: exactly one thread calls [`write`](RingBuffer::write)
//! and one thread calls [`read`](RingBuffer::read). The writer publishes
//! `tail` with release ordering after the bytes land and the reader
//! acquires it; symmetrically for `head`.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct RingBuffer {
    buffer: UnsafeCell<Box<[u8]>>,
    size: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

// SAFETY: the SPSC contract above means the writer only mutates the region
// between tail and head (its exclusive property until the release store of
// tail), and the reader only reads the region the writer has published.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a ring of at least `size_bytes`, rounded up to a power of
    /// two.
    pub fn new(size_bytes: usize) -> Self {
        let size = size_bytes.max(2).next_power_of_two();
        Self {
            buffer: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            size: size as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.size - 1
    }

    /// Allocated capacity in bytes; usable capacity is one less.
    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Writes up to `free()` bytes from `data`, wrapping internally.
    /// Returns the number of bytes written (producer side).
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        let used = tail - head;
        let free = (self.size - 1).saturating_sub(used);
        let count = (data.len() as u64).min(free);
        if count == 0 {
            return 0;
        }

        let tail_index = (tail & self.mask()) as usize;
        let until_end = (self.size - tail_index as u64).min(count) as usize;

        // SAFETY: the writer exclusively owns [tail, tail+free) until it
        // publishes the new tail below.
        unsafe {
            let buffer = &mut *self.buffer.get();
            buffer[tail_index..tail_index + until_end].copy_from_slice(&data[..until_end]);
            if (count as usize) > until_end {
                let wrapped = count as usize - until_end;
                buffer[..wrapped].copy_from_slice(&data[until_end..count as usize]);
            }
        }

        self.tail.store(tail + count, Ordering::Release);
        count as usize
    }

    /// Reads up to `available()` bytes into `out`, returning the number of
    /// bytes read (consumer side).
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let available = tail - head;
        let count = (out.len() as u64).min(available);
        if count == 0 {
            return 0;
        }

        let head_index = (head & self.mask()) as usize;
        let until_end = (self.size - head_index as u64).min(count) as usize;

        // SAFETY: the reader exclusively owns [head, tail); the acquire
        // load of tail ordered the writer's stores before this point.
        unsafe {
            let buffer = &*self.buffer.get();
            out[..until_end].copy_from_slice(&buffer[head_index..head_index + until_end]);
            if (count as usize) > until_end {
                let wrapped = count as usize - until_end;
                out[until_end..count as usize].copy_from_slice(&buffer[..wrapped]);
            }
        }

        self.head.store(head + count, Ordering::Release);
        count as usize
    }

    /// Bytes available to read.
    pub fn available(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Relaxed);
        (tail - head) as usize
    }

    /// Bytes free for writing.
    pub fn free(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        ((self.size - 1) - (tail - head)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Clears the ring. Not thread-safe; requires exclusive access.
    pub fn reset(&mut self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rounds_up_to_power_of_two() {
        let ring = RingBuffer::new(100);
        assert_eq!(ring.capacity(), 128);
        assert_eq!(ring.free(), 127);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let ring = RingBuffer::new(64);
        let data = b"hello ring buffer";
        assert_eq!(ring.write(data), data.len());
        assert_eq!(ring.available(), data.len());

        let mut out = vec![0u8; data.len()];
        assert_eq!(ring.read(&mut out), data.len());
        assert_eq!(&out, data);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_usable_capacity_is_size_minus_one() {
        let ring = RingBuffer::new(16);
        let data = [0xABu8; 32];
        assert_eq!(ring.write(&data), 15);
        assert!(ring.is_full());
        assert_eq!(ring.write(&data), 0);
    }

    #[test]
    fn test_wrapping_write_and_read() {
        let ring = RingBuffer::new(16);
        let mut out = [0u8; 16];

        // Advance the counters near the end of the buffer.
        assert_eq!(ring.write(&[1u8; 12]), 12);
        assert_eq!(ring.read(&mut out[..12]), 12);

        // This write wraps around the physical end.
        let data: Vec<u8> = (0u8..10).collect();
        assert_eq!(ring.write(&data), 10);
        let n = ring.read(&mut out);
        assert_eq!(n, 10);
        assert_eq!(&out[..10], &data[..]);
    }

    #[test]
    fn test_partial_write_when_nearly_full() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.write(&[7u8; 10]), 10);
        // Only 5 bytes of usable space remain.
        assert_eq!(ring.write(&[8u8; 10]), 5);

        let mut out = [0u8; 16];
        assert_eq!(ring.read(&mut out), 15);
        assert_eq!(&out[..10], &[7u8; 10]);
        assert_eq!(&out[10..15], &[8u8; 5]);
    }

    #[test]
    fn test_reset() {
        let mut ring = RingBuffer::new(16);
        ring.write(&[1, 2, 3]);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), 15);
    }

    #[test]
    fn test_spsc_threads_preserve_byte_order() {
        let ring = Arc::new(RingBuffer::new(256));
        let producer_ring = ring.clone();

        const TOTAL: usize = 100_000;
        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            while sent < TOTAL {
                let byte = (sent % 251) as u8;
                if producer_ring.write(&[byte]) == 1 {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        let mut buf = [0u8; 64];
        while received < TOTAL {
            let n = ring.read(&mut buf);
            for &byte in &buf[..n] {
                assert_eq!(byte, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
