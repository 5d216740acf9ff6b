//! Lock-free PCM sample ring buffer.
//!
//! Single-producer / single-consumer bounded queue of 16-bit samples with a
//! drop-oldest overwrite policy: the USB event thread writes packets as they
//! complete and the audio callback thread drains them, so when the consumer
//! falls behind the newest samples win. Positions are monotonic atomic
//! counters; no mutex is involved on either path.

#![allow(unsafe_code)]

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

struct RingInner {
    buf: Box<[UnsafeCell<u16>]>,
    capacity: u64,
    /// Total samples consumed. Advanced by the consumer, and by the
    /// producer when overwriting unread samples.
    read: AtomicU64,
    /// Total samples produced. Advanced only by the producer.
    write: AtomicU64,
}

// Safety: every slot is only accessed through the unique producer and
// consumer handles; the position counters bound which half may touch a slot.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

impl RingInner {
    fn size(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        w.saturating_sub(r) as usize
    }

    unsafe fn copy_in(&self, pos: u64, data: &[u16]) {
        let start = (pos % self.capacity) as usize;
        let first = data.len().min(self.capacity as usize - start);
        for (i, &sample) in data[..first].iter().enumerate() {
            *self.buf[start + i].get() = sample;
        }
        for (i, &sample) in data[first..].iter().enumerate() {
            *self.buf[i].get() = sample;
        }
    }

    unsafe fn copy_out(&self, pos: u64, dst: &mut [u16]) {
        let start = (pos % self.capacity) as usize;
        let first = dst.len().min(self.capacity as usize - start);
        for (i, slot) in dst[..first].iter_mut().enumerate() {
            *slot = *self.buf[start + i].get();
        }
        let rest = dst.len() - first;
        for (i, slot) in dst[first..first + rest].iter_mut().enumerate() {
            *slot = *self.buf[i].get();
        }
    }
}

/// Creates a ring buffer of the given sample capacity.
///
/// Returns the producer and consumer halves. Capacity must be non-zero.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring buffer capacity must be non-zero");
    let buf = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let inner = Arc::new(RingInner {
        buf,
        capacity: capacity as u64,
        read: AtomicU64::new(0),
        write: AtomicU64::new(0),
    });
    (RingProducer { inner: inner.clone() }, RingConsumer { inner })
}

/// Writing half of a [`ring_buffer`].
pub struct RingProducer {
    inner: Arc<RingInner>,
}

impl RingProducer {
    /// Appends samples, overwriting the oldest unread samples when full.
    ///
    /// When `data` is longer than the capacity only its final `capacity`
    /// samples are kept. Returns the number of samples written.
    pub fn write(&mut self, data: &[u16]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let inner = &*self.inner;
        let capacity = inner.capacity as usize;
        let data = if data.len() > capacity { &data[data.len() - capacity..] } else { data };

        let w = inner.write.load(Ordering::Relaxed);
        let r = inner.read.load(Ordering::Acquire);
        let size = w.saturating_sub(r) as usize;

        // claim space before touching slots the consumer may still be on
        if size + data.len() > capacity {
            let new_read = w + data.len() as u64 - inner.capacity;
            inner.read.fetch_max(new_read, Ordering::AcqRel);
        }

        // Safety: slots w..w+len are outside the consumer's range after the
        // read position was advanced above.
        unsafe { inner.copy_in(w, data) };
        inner.write.store(w + data.len() as u64, Ordering::Release);
        data.len()
    }

    /// Samples currently queued.
    pub fn len(&self) -> usize {
        self.inner.size()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }
}

/// Reading half of a [`ring_buffer`].
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

impl RingConsumer {
    /// Removes up to `dst.len()` samples into `dst`.
    ///
    /// Returns the number of samples read; zero when the queue is empty.
    /// Never blocks.
    pub fn read(&mut self, dst: &mut [u16]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let inner = &*self.inner;
        let w = inner.write.load(Ordering::Acquire);
        let r = inner.read.load(Ordering::Acquire);
        let available = w.saturating_sub(r) as usize;
        if available == 0 {
            return 0;
        }

        let n = dst.len().min(available);
        // Safety: slots r..r+n hold produced samples; the producer only
        // overwrites them after advancing the read position.
        unsafe { inner.copy_out(r, &mut dst[..n]) };
        // fetch_max keeps the position monotonic if the producer overwrote
        // part of the range while we were copying
        inner.read.fetch_max(r + n as u64, Ordering::AcqRel);
        n
    }

    /// Samples currently queued.
    pub fn len(&self) -> usize {
        self.inner.size()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use rand_xoshiro::Xoshiro128StarStar;

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = ring_buffer(16);
        assert_eq!(tx.write(&[1, 2, 3, 4]), 4);
        assert_eq!(tx.len(), 4);

        let mut out = [0u16; 3];
        assert_eq!(rx.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(rx.len(), 1);

        let mut out = [0u16; 4];
        assert_eq!(rx.read(&mut out), 1);
        assert_eq!(out[0], 4);
        assert_eq!(rx.read(&mut out), 0);
    }

    #[test]
    fn overrun_keeps_newest() {
        let (mut tx, mut rx) = ring_buffer(8);
        let data: Vec<u16> = (0..12).collect();
        assert_eq!(tx.write(&data), 8);
        assert_eq!(tx.len(), 8);

        let mut out = [0u16; 8];
        assert_eq!(rx.read(&mut out), 8);
        assert_eq!(out, [4, 5, 6, 7, 8, 9, 10, 11]);

        assert_eq!(tx.write(&[12, 13, 14, 15]), 4);
        let mut out = [0u16; 4];
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(out, [12, 13, 14, 15]);
    }

    #[test]
    fn overwrite_drops_oldest() {
        let (mut tx, mut rx) = ring_buffer(4);
        tx.write(&[1, 2, 3]);
        tx.write(&[4, 5]);
        assert_eq!(tx.len(), 4);

        let mut out = [0u16; 4];
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(out, [2, 3, 4, 5]);
    }

    #[test]
    fn wrap_around_copies() {
        let (mut tx, mut rx) = ring_buffer(6);
        tx.write(&[1, 2, 3, 4]);
        let mut out = [0u16; 4];
        rx.read(&mut out);
        // the next write wraps the end of the slot array
        tx.write(&[5, 6, 7, 8]);
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(out, [5, 6, 7, 8]);
    }

    #[test]
    fn size_stays_bounded() {
        let mut rng = Xoshiro128StarStar::seed_from_u64(7);
        let (mut tx, mut rx) = ring_buffer(32);
        for _ in 0..1000 {
            if rng.gen_bool(0.6) {
                let n = rng.gen_range(0..48);
                let data: Vec<u16> = (0..n).map(|_| rng.gen()).collect();
                tx.write(&data);
            } else {
                let mut out = vec![0u16; rng.gen_range(0..48)];
                rx.read(&mut out);
            }
            assert!(tx.len() <= tx.capacity());
        }
    }

    #[test]
    fn reads_are_a_suffix_of_writes() {
        let mut rng = Xoshiro128StarStar::seed_from_u64(21);
        let (mut tx, mut rx) = ring_buffer(16);
        let mut next = 0u16;
        let mut last_read: Option<u16> = None;

        for _ in 0..500 {
            if rng.gen_bool(0.5) {
                let n = rng.gen_range(1..12);
                let data: Vec<u16> = (0..n).map(|_| {
                    let v = next;
                    next = next.wrapping_add(1);
                    v
                }).collect();
                tx.write(&data);
            } else {
                let mut out = vec![0u16; rng.gen_range(1..12)];
                let n = rx.read(&mut out);
                for &v in &out[..n] {
                    // samples appear in order; gaps only ever skip forward
                    if let Some(prev) = last_read {
                        assert!(v > prev, "sample {v} after {prev}");
                    }
                    last_read = Some(v);
                }
            }
        }
    }
}
