//! Bounded SPSC ring queue of frame handles.
//!
//! Mirrors the original `audio_queue.c`: a slot array plus head/tail
//! atomic indices, producer writes `tail` with release ordering after
//! storing the slot, consumer writes `head` with release ordering
//! after reading it. Usable capacity is `Q - 1` slots.

use crate::pool::FrameHandle;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

struct Slot {
    handle: UnsafeCell<Option<FrameHandle>>,
}

/// A bounded single-producer/single-consumer ring of [`FrameHandle`]s.
///
/// Exactly one thread may call [`push`](FrameQueue::push) and exactly
/// one thread (possibly different) may call [`pop`](FrameQueue::pop)
/// for the lifetime of the queue.
pub struct FrameQueue {
    slots: Box<[Slot]>,
    cap: u32,
    head: AtomicU32, // consumer-owned
    tail: AtomicU32, // producer-owned
}

// SAFETY: slot contents are only touched by the single producer (for
// the slot it is about to publish) and the single consumer (for the
// slot it is about to consume), never both at once — enforced by the
// SPSC contract, not by this type.
unsafe impl Sync for FrameQueue {}
unsafe impl Send for FrameQueue {}

fn next_idx(cur: u32, cap: u32) -> u32 {
    let n = cur + 1;
    if n == cap {
        0
    } else {
        n
    }
}

impl FrameQueue {
    /// `capacity` must be at least 2; usable slots are `capacity - 1`.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity >= 2, "queue capacity must be at least 2");
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot {
                handle: UnsafeCell::new(None),
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            cap: capacity,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.cap - 1
    }

    /// Pushes a handle onto the queue. Constant-time, non-blocking.
    /// On rejection (queue full) the handle is handed back so the
    /// caller can release it to its pool and count a drop.
    pub fn push(&self, handle: FrameHandle) -> Result<(), FrameHandle> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        let next = next_idx(tail, self.cap);
        if next == head {
            return Err(handle); // full
        }

        // SAFETY: slot `tail` is not owned by the consumer until `tail`
        // is published below (consumer only reads up to `tail`).
        unsafe {
            *self.slots[tail as usize].handle.get() = Some(handle);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Pops the oldest handle. Constant-time, non-blocking.
    pub fn pop(&self) -> Option<FrameHandle> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None; // empty
        }

        // SAFETY: slot `head` was published by the producer's release
        // store of `tail` observed above.
        let handle = unsafe { (*self.slots[head as usize].handle.get()).take() };
        self.head.store(next_idx(head, self.cap), Ordering::Release);
        handle
    }

    /// Approximate occupied length (racy with concurrent push/pop;
    /// diagnostics only).
    pub fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        if tail >= head {
            tail - head
        } else {
            self.cap - head + tail
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{release, FramePool};

    #[test]
    fn fifo_order_preserved() {
        let pool = FramePool::new(8, 1, 4);
        let q = FrameQueue::new(4); // usable capacity 3

        let mut pushed = Vec::new();
        for i in 0..3u32 {
            let mut h = pool.acquire().unwrap();
            h.samples_mut()[0] = i as f32;
            h.set_sample_frames(1);
            pushed.push(i);
            q.push(h).unwrap();
        }

        for i in pushed {
            let h = q.pop().unwrap();
            assert_eq!(h.valid_samples()[0], i as f32);
            release(h);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn push_rejected_when_full() {
        let pool = FramePool::new(8, 1, 4);
        let q = FrameQueue::new(3); // usable capacity 2

        q.push(pool.acquire().unwrap()).unwrap();
        q.push(pool.acquire().unwrap()).unwrap();
        let rejected = q.push(pool.acquire().unwrap());
        assert!(rejected.is_err());
        // The rejected handle is returned so the caller can release it.
        release(rejected.unwrap_err());
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let q = FrameQueue::new(2);
        assert!(q.pop().is_none());
    }
}
