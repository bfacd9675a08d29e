//! Bounded rings used for all message handoff in the crate.
//!
//! Three variants:
//!
//! - [`SpscRing`] — wait-free single-producer/single-consumer ring with a
//!   zero-copy slot protocol. Used where producer and consumer are
//!   different threads (raw message ring, transport control ring).
//! - [`LocalRing`] — the same shape without atomics, for rings whose
//!   producer and consumer are both the application thread (typed message
//!   rings, signal ring, user rejection buffer).
//! - [`LastValue`] — a single slot with per-reader change detection, for
//!   state-like messages where freshness beats history (pong, status).
//!
//! Failed operations return without blocking or allocating. Capacities are
//! compile-time powers of two; backing storage is allocated once at
//! construction and recycled for the life of the ring.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Wait-free bounded SPSC ring.
///
/// Contract: exactly one thread calls the producer methods (`push`,
/// `try_acquire_producer_slot`, `commit_producer_slot`) and exactly one
/// thread calls the consumer methods (`pop`, `peek_consumer_slot`,
/// `release_consumer_slot`). No attempt at multi-producer correctness.
///
/// One slot is sacrificed to distinguish full from empty, so a ring of
/// capacity `N` holds at most `N - 1` elements.
pub struct SpscRing<T, const N: usize> {
    buffer: Box<[UnsafeCell<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: slots are only ever accessed under the SPSC index protocol —
// the producer touches slots in [head, tail) exclusively and publishes
// them with a release store; the consumer acquires before reading.
unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}
unsafe impl<T: Send, const N: usize> Send for SpscRing<T, N> {}

impl<T: Default, const N: usize> SpscRing<T, N> {
    const CAPACITY_CHECK: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "ring capacity must be a power of two and >= 2"
    );

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        let buffer: Vec<UnsafeCell<T>> = (0..N).map(|_| UnsafeCell::new(T::default())).collect();
        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl<T: Default, const N: usize> Default for SpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> SpscRing<T, N> {
    const IDX_MASK: usize = N - 1;

    /// Producer: enqueue a value. Returns the value back when the ring is
    /// full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & Self::IDX_MASK;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(value); // full
        }
        // SAFETY: `head` is owned by the producer and not yet published.
        unsafe { *self.buffer[head].get() = value };
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer: dequeue into `out`. Returns false when the ring is empty.
    /// On success the previous content of `out` is parked in the slot for
    /// recycling.
    pub fn pop(&self, out: &mut T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return false; // empty
        }
        // SAFETY: `tail` was published by the producer and is not yet
        // released, so the consumer has exclusive access.
        unsafe { std::mem::swap(out, &mut *self.buffer[tail].get()) };
        self.tail.store((tail + 1) & Self::IDX_MASK, Ordering::Release);
        true
    }

    /// Producer: zero-copy acquisition of the next free slot. Returns
    /// `None` when the ring is full. Calling this again before
    /// [`commit_producer_slot`](Self::commit_producer_slot) yields the same
    /// slot.
    #[allow(clippy::mut_from_ref)]
    pub fn try_acquire_producer_slot(&self) -> Option<&mut T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & Self::IDX_MASK;
        if next == self.tail.load(Ordering::Acquire) {
            return None; // full
        }
        // SAFETY: the slot at `head` is unpublished; only the single
        // producer can reach it until the commit below.
        Some(unsafe { &mut *self.buffer[head].get() })
    }

    /// Producer: publish the slot handed out by the last successful
    /// acquisition.
    pub fn commit_producer_slot(&self) {
        let head = self.head.load(Ordering::Relaxed);
        self.head.store((head + 1) & Self::IDX_MASK, Ordering::Release);
    }

    /// Consumer: zero-copy view of the oldest committed slot. The
    /// reference is valid until [`release_consumer_slot`](Self::release_consumer_slot).
    pub fn peek_consumer_slot(&self) -> Option<&T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None; // empty
        }
        // SAFETY: published slot, exclusive to the single consumer.
        Some(unsafe { &*self.buffer[tail].get() })
    }

    /// Consumer: recycle the slot returned by the last successful peek.
    pub fn release_consumer_slot(&self) {
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store((tail + 1) & Self::IDX_MASK, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let next = (self.head.load(Ordering::Relaxed) + 1) & Self::IDX_MASK;
        next == self.tail.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        (h.wrapping_sub(t)) & Self::IDX_MASK
    }

    pub fn free_slots(&self) -> usize {
        N - 1 - self.used()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Drop all queued elements. Consumer-side: only safe for a *full*
    /// reset when the producer is quiescent (the transport uses it at the
    /// epoch boundary, after the old receive task has been joined).
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

/// Single-threaded fixed-capacity ring. Same shape as [`SpscRing`] without
/// atomics; must only be used from one thread.
pub struct LocalRing<T, const N: usize> {
    buffer: Box<[T]>,
    head: usize,
    tail: usize,
}

impl<T: Default, const N: usize> LocalRing<T, N> {
    const CAPACITY_CHECK: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "ring capacity must be a power of two and >= 2"
    );

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        let buffer: Vec<T> = (0..N).map(|_| T::default()).collect();
        Self {
            buffer: buffer.into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }
}

impl<T: Default, const N: usize> Default for LocalRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> LocalRing<T, N> {
    const IDX_MASK: usize = N - 1;

    pub fn push(&mut self, value: T) -> Result<(), T> {
        let next = (self.head + 1) & Self::IDX_MASK;
        if next == self.tail {
            return Err(value); // full
        }
        self.buffer[self.head] = value;
        self.head = next;
        Ok(())
    }

    pub fn pop(&mut self, out: &mut T) -> bool {
        if self.tail == self.head {
            return false; // empty
        }
        std::mem::swap(out, &mut self.buffer[self.tail]);
        self.tail = (self.tail + 1) & Self::IDX_MASK;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        ((self.head + 1) & Self::IDX_MASK) == self.tail
    }

    pub fn used(&self) -> usize {
        (self.head.wrapping_sub(self.tail)) & Self::IDX_MASK
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// Last-value slot with change detection.
///
/// Intermediate values may be overwritten; no backpressure or buffering is
/// applied. [`try_load`](Self::try_load) returns true only when the stored
/// value changed since the caller last observed it, so misses are not
/// errors.
pub struct LastValue<T> {
    value: Option<T>,
    version: u64,
    seen: u64,
}

impl<T> Default for LastValue<T> {
    fn default() -> Self {
        Self {
            value: None,
            version: 0,
            seen: 0,
        }
    }
}

impl<T> LastValue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored value. Freshness over history.
    pub fn store(&mut self, value: T) {
        self.value = Some(value);
        self.version += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

impl<T: Clone> LastValue<T> {
    /// Copy out the latest value if it changed since the last load.
    pub fn try_load(&mut self, out: &mut T) -> bool {
        if self.version == self.seen {
            return false;
        }
        match &self.value {
            Some(v) => {
                *out = v.clone();
                self.seen = self.version;
                true
            }
            None => false,
        }
    }
}
