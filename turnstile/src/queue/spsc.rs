//! Single-producer single-consumer queue.
//!
//! No CAS anywhere: each index has exactly one writer. The producer avoids
//! checking every slot by probing one slot a look-ahead step ahead
//! (`min(capacity / 4, 4096)`). If that slot is empty, every slot before it is
//! too, so the producer can write up to it without looking again.
//!
//! # Example
//!
//! ```
//! use turnstile::queue::spsc;
//!
//! let (tx, mut rx) = spsc::channel::<String>(16).unwrap();
//!
//! tx.offer("hello".to_string()).unwrap();
//! assert_eq!(rx.peek().map(String::as_str), Some("hello"));
//! assert_eq!(rx.poll(), Some("hello".to_string()));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::slot::{FlagSlot, ProducerCache};
use super::{
    ExitCondition, IdleStrategy, PhantomUnsync, QueueError, Timeout, current_len,
    look_ahead_step, offer_until, poll_until, queue_capacity, run_rounds,
};
use crate::slots::SlotArray;

/// Smallest capacity an SPSC queue is built with.
pub const MIN_CAPACITY: usize = 4;

/// Producer-side state: write index and the cached write limit.
#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    /// Next index to write. Owned by the producer, read by the consumer for `len`.
    index: AtomicUsize,

    /// Indices below this are known to be free.
    limit: ProducerCache<usize>,
}

/// Consumer-side state: read index.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    /// Next index to read. Owned by the consumer, read by the producer for `len`.
    index: AtomicUsize,
}

#[repr(C)]
struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    look_ahead_step: usize,
    slots: SlotArray<FlagSlot<T>>,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            producer: ProducerState {
                index: AtomicUsize::new(0),
                limit: ProducerCache::new(0),
            },
            consumer: ConsumerState {
                index: AtomicUsize::new(0),
            },
            look_ahead_step: look_ahead_step(capacity, 1),
            slots: SlotArray::new(capacity, |_| FlagSlot::new()),
        }
    }

    /// # Safety
    ///
    /// Only the single producer may call this.
    #[inline]
    unsafe fn offer(&self, item: T) -> Result<(), T> {
        let index = self.producer.index.load(Ordering::Relaxed);

        // SAFETY: the producer owns its limit cache.
        let limit = unsafe { self.producer.limit.load() };
        // SAFETY: forwarded producer ownership.
        if index >= limit && !unsafe { self.offer_slow_path(index) } {
            return Err(item);
        }

        // SAFETY: the slot is empty (below the limit or just checked) and only
        // the producer writes slots.
        unsafe { self.slots.slot(index).put(item) };
        self.producer
            .index
            .store(index.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Probes the look-ahead slot and raises the limit if it is free.
    ///
    /// Falls back to checking the slot at `index` alone. Returns whether
    /// `index` can be written.
    ///
    /// # Safety
    ///
    /// Only the single producer may call this.
    #[cold]
    unsafe fn offer_slow_path(&self, index: usize) -> bool {
        let look_ahead = index.wrapping_add(self.look_ahead_step);
        if !self.slots.slot(look_ahead).is_full() {
            // SAFETY: the producer owns its limit cache.
            unsafe { self.producer.limit.store(look_ahead) };
            true
        } else {
            !self.slots.slot(index).is_full()
        }
    }

    /// # Safety
    ///
    /// Only the single producer may call this.
    unsafe fn fill(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        let start = self.producer.index.load(Ordering::Relaxed);
        let mut filled = 0;
        while filled < limit {
            let index = start.wrapping_add(filled);
            if !self
                .slots
                .slot(index.wrapping_add(self.look_ahead_step))
                .is_full()
            {
                // The whole run up to the look-ahead slot is free.
                let batch = self.look_ahead_step.min(limit - filled);
                for offset in 0..batch {
                    let index = index.wrapping_add(offset);
                    // SAFETY: free per the look-ahead probe; only the producer writes.
                    unsafe { self.slots.slot(index).put(supplier()) };
                    self.producer
                        .index
                        .store(index.wrapping_add(1), Ordering::Release);
                }
                filled += batch;
            } else {
                let slot = self.slots.slot(index);
                if slot.is_full() {
                    return filled;
                }
                // SAFETY: observed empty; only the producer writes.
                unsafe { slot.put(supplier()) };
                self.producer
                    .index
                    .store(index.wrapping_add(1), Ordering::Release);
                filled += 1;
            }
        }
        limit
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    unsafe fn poll(&self) -> Option<T> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        let slot = self.slots.slot(index);
        if !slot.is_full() {
            return None;
        }
        // SAFETY: the slot is full and only the consumer reads slots.
        let item = unsafe { slot.take() };
        self.consumer
            .index
            .store(index.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// # Safety
    ///
    /// Only the single consumer may call this, and it must not poll while the
    /// returned reference is alive.
    #[inline]
    unsafe fn peek(&self) -> Option<&T> {
        let slot = self.slots.slot(self.consumer.index.load(Ordering::Relaxed));
        // SAFETY: full, and the producer won't touch it until the consumer takes it.
        slot.is_full().then(|| unsafe { slot.get() })
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn drain(&self, mut f: impl FnMut(T), limit: usize) -> usize {
        for drained in 0..limit {
            // SAFETY: forwarded consumer ownership.
            match unsafe { self.poll() } {
                Some(item) => f(item),
                None => return drained,
            }
        }
        limit
    }

    fn len(&self) -> usize {
        current_len(
            &self.producer.index,
            &self.consumer.index,
            self.slots.capacity(),
        )
    }
}

/// Write end of the SPSC queue.
///
/// `Producer` is [`Send`] but **not** [`Sync`] or [`Clone`]: it can move to
/// another thread, but only one thread can ever offer.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPSC queue.
///
/// See [`Producer`] for thread safety details (same semantics apply).
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new SPSC queue holding at least `capacity` elements.
///
/// Capacity is rounded up to a power of two, and to at least [`MIN_CAPACITY`].
///
/// # Errors
///
/// Returns [`QueueError`] if `capacity` is zero or cannot be rounded up.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    let capacity = queue_capacity(capacity, MIN_CAPACITY)?;
    let ring = Arc::new(Ring::new(capacity));

    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };
    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };
    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Attempts to enqueue an item (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn offer(&self, item: T) -> Result<(), T> {
        // SAFETY: Producer is the only handle on the producer side and is !Sync.
        unsafe { self.ring.offer(item) }
    }

    /// Same as [`offer`](Self::offer); the single producer has no check to relax.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn relaxed_offer(&self, item: T) -> Result<(), T> {
        self.offer(item)
    }

    /// Spins until space is available, then enqueues.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn offer_blocking(&self, item: T, timeout: Timeout) -> Result<(), T> {
        offer_until(item, timeout, |item| self.offer(item))
    }

    /// Enqueues up to `limit` elements produced by `supplier`.
    ///
    /// `supplier` is only called for slots that are known to be free. Returns
    /// the number of elements added.
    pub fn fill(&self, supplier: impl FnMut() -> T, limit: usize) -> usize {
        // SAFETY: see offer.
        unsafe { self.ring.fill(supplier, limit) }
    }

    /// Enqueues until the queue is full or `capacity` elements were added.
    pub fn fill_all(&self, supplier: impl FnMut() -> T) -> usize {
        self.fill(supplier, self.capacity())
    }

    /// Keeps filling while `exit` allows, calling `idle` when the queue stays full.
    pub fn fill_with(
        &self,
        mut supplier: impl FnMut() -> T,
        idle: impl IdleStrategy,
        exit: impl ExitCondition,
    ) -> usize {
        run_rounds(|limit| self.fill(&mut supplier, limit), idle, exit)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slots.capacity()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements ever offered.
    #[must_use]
    pub fn producer_index(&self) -> usize {
        self.ring.producer.index.load(Ordering::Acquire)
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to dequeue an item (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> Option<T> {
        // SAFETY: Consumer is the only handle on the consumer side and is !Sync.
        unsafe { self.ring.poll() }
    }

    /// Same as [`poll`](Self::poll).
    #[inline]
    #[must_use]
    pub fn relaxed_poll(&self) -> Option<T> {
        self.poll()
    }

    /// Returns a reference to the next element without removing it.
    #[inline]
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        // SAFETY: &mut self keeps poll from running while the reference lives.
        unsafe { self.ring.peek() }
    }

    /// Spins until an item is available, then dequeues it.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn poll_blocking(&self, timeout: Timeout) -> Option<T> {
        poll_until(timeout, || self.poll())
    }

    /// Hands up to `limit` elements to `f`, in FIFO order. Returns how many were drained.
    pub fn drain(&self, f: impl FnMut(T), limit: usize) -> usize {
        // SAFETY: see poll.
        unsafe { self.ring.drain(f, limit) }
    }

    /// Drains up to `capacity` elements.
    pub fn drain_all(&self, f: impl FnMut(T)) -> usize {
        self.drain(f, self.capacity())
    }

    /// Keeps draining while `exit` allows, calling `idle` when the queue stays empty.
    pub fn drain_with(
        &self,
        mut f: impl FnMut(T),
        idle: impl IdleStrategy,
        exit: impl ExitCondition,
    ) -> usize {
        run_rounds(|limit| self.drain(&mut f, limit), idle, exit)
    }

    /// Drops every element currently visible.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slots.capacity()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements ever polled.
    #[must_use]
    pub fn consumer_index(&self) -> usize {
        self.ring.consumer.index.load(Ordering::Acquire)
    }
}
