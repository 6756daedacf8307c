//! Bounded SPSC hand-off ring between a transport's IO thread and its
//! consumer thread.
//!
//! Design principles:
//! - Single producer (the WS read loop), single consumer (the parse loop)
//! - Acquire/release index protocol, no locks
//! - Back-pressure is drop-on-full: market data freshness beats completeness

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest ring we will allocate.
const MIN_CAPACITY: usize = 8;

/// Wait-free single-producer/single-consumer queue of owned frames.
///
/// Capacity is rounded up to the next power of two (minimum 8) so slot
/// lookup is a mask instead of a modulo. `head` only advances on the
/// producer thread, `tail` only on the consumer thread; indices grow
/// monotonically and wrap via the mask.
pub struct FrameRing {
    slots: Box<[UnsafeCell<Option<String>>]>,
    mask: usize,
    /// Producer index; published with Release after the slot is written.
    head: AtomicUsize,
    /// Consumer index; published with Release after the slot is taken.
    tail: AtomicUsize,
}

// SAFETY: the SPSC protocol guarantees each slot is touched by at most one
// thread at a time: the producer writes a slot strictly before releasing
// `head` past it, and the consumer reads it strictly before releasing
// `tail` past it.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(MIN_CAPACITY).next_power_of_two();
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Append a frame. Returns `false` (and drops the frame) when full.
    ///
    /// Must only be called from the single producer thread.
    #[inline]
    pub fn try_push(&self, frame: String) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.capacity() {
            return false;
        }
        // SAFETY: `head` has not been published past this slot, so the
        // consumer cannot be reading it.
        unsafe {
            *self.slots[head & self.mask].get() = Some(frame);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Take the frame at the front, if any.
    ///
    /// Must only be called from the single consumer thread.
    #[inline]
    pub fn try_pop(&self) -> Option<String> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the producer released `head` past this slot, so the write
        // is visible and it will not touch the slot again until `tail`
        // advances past it.
        let frame = unsafe { (*self.slots[tail & self.mask].get()).take() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        frame
    }

    /// Number of queued frames. Approximate while both sides are running,
    /// exact when quiescent.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Reset both indices and free queued frames.
    ///
    /// Requires exclusive access, which is exactly the "producer and
    /// consumer both paused" precondition.
    pub fn clear(&mut self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        for slot in self.slots.iter_mut() {
            *slot.get_mut() = None;
        }
    }
}
