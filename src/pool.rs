//! Lock-free, allocation-free audio frame pool.
//!
//! Mirrors the original `frame_pool.c`'s atomic free-stack algorithm:
//! a stable array of frame slots plus a stack of free indices guarded
//! by a single atomic `top` counter. `acquire` is an SPSC pop (one
//! consumer thread), `release` is an SPSC push (one producer thread,
//! not necessarily the same thread as the acquirer).
//!
//! Ownership is expressed through `FrameHandle` rather than a raw
//! pointer plus a back-reference: a handle can only be produced by
//! `acquire`, it is `!Clone`, and dropping it returns the frame to its
//! pool automatically. This makes "foreign handle release" and
//! "double release" structurally unreachable here, rather than merely
//! checked at runtime.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct FrameSlot {
    data: UnsafeCell<Vec<f32>>,
    sample_frames: UnsafeCell<u32>,
    channels: u32,
}

// SAFETY: access to a slot's interior is serialized by the pool's
// acquire/release handoff — only the thread currently holding the
// `FrameHandle` for a slot touches its `UnsafeCell`s.
unsafe impl Sync for FrameSlot {}

struct PoolInner {
    slots: Box<[FrameSlot]>,
    free_stack: Box<[UnsafeCell<u32>]>,
    top: AtomicU32,
    capacity: u32,
    drops: AtomicU32,
}

// SAFETY: `free_stack` entries are only read/written under the
// happens-before edge established by `top`'s acquire/release ordering.
unsafe impl Sync for PoolInner {}

/// A process-wide collection of pre-allocated audio frames.
///
/// Cheap to clone (an `Arc` bump); clone once for the producer side and
/// once for the consumer side. Calling `acquire` from more than one
/// thread concurrently, or `release` from more than one thread
/// concurrently, is a contract violation.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Allocates `capacity` frames, each holding `sample_frames_capacity`
    /// sample-frames of `channels` interleaved f32 samples. No further
    /// allocation occurs after this call. Not real-time safe.
    pub fn new(capacity: u32, channels: u32, sample_frames_capacity: u32) -> Self {
        assert!(capacity > 0 && channels > 0 && sample_frames_capacity > 0);

        let mut slots = Vec::with_capacity(capacity as usize);
        let mut free_stack = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            slots.push(FrameSlot {
                data: UnsafeCell::new(vec![0.0f32; (sample_frames_capacity * channels) as usize]),
                sample_frames: UnsafeCell::new(0),
                channels,
            });
            free_stack.push(UnsafeCell::new(i));
        }

        Self {
            inner: Arc::new(PoolInner {
                slots: slots.into_boxed_slice(),
                free_stack: free_stack.into_boxed_slice(),
                top: AtomicU32::new(capacity),
                capacity,
                drops: AtomicU32::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Number of free handles right now (racy with concurrent acquire/release;
    /// intended for diagnostics, not synchronization).
    pub fn free_count(&self) -> u32 {
        self.inner.top.load(Ordering::Relaxed)
    }

    /// Total count of pool-exhaustion events observed by `acquire`.
    pub fn drops(&self) -> u32 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    /// Constant-time, non-blocking, allocation-free. Returns `None` if the
    /// pool is exhausted — a bounded backpressure signal, not an error.
    pub fn acquire(&self) -> Option<FrameHandle> {
        let t = self.inner.top.load(Ordering::Acquire);
        if t == 0 {
            self.inner.drops.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `t > 0` and `t <= capacity` is the loop invariant of
        // `top`; index `t - 1` was published by the matching release's
        // store-then-release-store sequence below.
        let idx = unsafe { *self.inner.free_stack[(t - 1) as usize].get() };
        self.inner.top.store(t - 1, Ordering::Relaxed);

        let slot = &self.inner.slots[idx as usize];
        // SAFETY: slot `idx` was free (owned by no handle) until this store.
        unsafe {
            *slot.sample_frames.get() = 0;
        }

        Some(FrameHandle {
            pool: self.inner.clone(),
            index: idx,
        })
    }
}

/// An acquired audio frame. Unique ownership: exactly one `FrameHandle`
/// for a given slot index exists at a time. Dropping it releases the
/// frame back to its pool.
pub struct FrameHandle {
    pool: Arc<PoolInner>,
    index: u32,
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("index", &self.index)
            .finish()
    }
}

// SAFETY: the handle is handed from the acquiring thread to the
// releasing thread across the FrameQueue; at any instant exactly one
// thread holds it.
unsafe impl Send for FrameHandle {}

impl FrameHandle {
    fn slot(&self) -> &FrameSlot {
        &self.pool.slots[self.index as usize]
    }

    pub fn channels(&self) -> u32 {
        self.slot().channels
    }

    pub fn capacity_sample_frames(&self) -> u32 {
        let ch = self.channels();
        if ch == 0 {
            0
        } else {
            // SAFETY: exclusive access while acquired.
            (unsafe { &*self.slot().data.get() }).len() as u32 / ch
        }
    }

    pub fn sample_frames(&self) -> u32 {
        // SAFETY: exclusive access while acquired.
        unsafe { *self.slot().sample_frames.get() }
    }

    /// Sets the number of valid sample-frames currently held. Must be
    /// `<= capacity_sample_frames()`.
    pub fn set_sample_frames(&mut self, n: u32) {
        debug_assert!(n <= self.capacity_sample_frames());
        // SAFETY: exclusive access while acquired.
        unsafe {
            *self.slot().sample_frames.get() = n;
        }
    }

    /// Full backing buffer (fixed capacity, independent of `sample_frames`).
    pub fn samples_mut(&mut self) -> &mut [f32] {
        // SAFETY: exclusive access while acquired.
        unsafe { &mut *self.slot().data.get() }
    }

    /// The valid portion of the buffer, `sample_frames() * channels()` long.
    pub fn valid_samples(&self) -> &[f32] {
        let len = (self.sample_frames() * self.channels()) as usize;
        // SAFETY: exclusive access while acquired.
        &(unsafe { &*self.slot().data.get() })[..len]
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        let pool = &self.pool;
        let t = pool.top.load(Ordering::Relaxed);
        if t >= pool.capacity {
            // Defensive: indicates misuse (e.g. a foreign handle reached
            // this pool). Structurally unreachable through the public
            // API; kept for parity with the original's defensive check.
            return;
        }

        // SAFETY: slot `t` is free capacity; no handle currently owns it.
        unsafe {
            *pool.free_stack[t as usize].get() = self.index;
        }
        pool.top.store(t + 1, Ordering::Release);
    }
}

/// Explicit alias for `drop(handle)`, spelled out for readers looking
/// for the `release()` half of the acquire/release contract.
pub fn release(handle: FrameHandle) {
    drop(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trips() {
        let pool = FramePool::new(4, 2, 48);
        assert_eq!(pool.free_count(), 4);

        let h = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(h.channels(), 2);
        assert_eq!(h.capacity_sample_frames(), 48);

        release(h);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_is_backpressure_not_panic() {
        let pool = FramePool::new(2, 1, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.drops(), 1);

        drop(a);
        let c = pool.acquire().unwrap();
        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn in_flight_plus_free_equals_capacity() {
        let pool = FramePool::new(8, 2, 16);
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.acquire().unwrap());
        }
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.free_count() as usize + handles.len(), 8);

        handles.truncate(2);
        assert_eq!(pool.free_count(), 6);
    }

    #[test]
    fn written_samples_round_trip() {
        let pool = FramePool::new(1, 2, 4);
        let mut h = pool.acquire().unwrap();
        {
            let buf = h.samples_mut();
            buf[0] = 0.5;
            buf[1] = -0.5;
        }
        h.set_sample_frames(1);
        assert_eq!(h.valid_samples(), &[0.5, -0.5]);
    }
}
