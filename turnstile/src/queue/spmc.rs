//! Single-producer multi-consumer queue.
//!
//! The producer writes a slot only after it observes the slot empty. Consumers
//! race on a shared consumer index with CAS. To avoid reading the producer
//! index on every call, they compare against a shared snapshot of it that is
//! refreshed only when exhausted. After winning the CAS, a consumer owns the
//! slot and moves the element out with a plain read.
//!
//! A consumer that has won index `i` may not have emptied slot `i` yet when
//! the producer comes round again. The producer tells that case apart from a
//! genuinely full queue by checking the consumer index, and waits for the
//! in-flight read to finish.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use super::slot::FlagSlot;
use super::{
    ExitCondition, IdleStrategy, PhantomUnsync, QueueError, Timeout, current_len, offer_until,
    poll_until, queue_capacity, run_rounds,
};
use crate::slots::SlotArray;

#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    /// Next index to write. Only the producer modifies this.
    index: AtomicUsize,
}

/// Consumers' shared snapshot of the producer index.
#[repr(C)]
#[repr(align(64))]
struct ProducerIndexCache {
    index: AtomicUsize,
}

#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    /// Next index to claim. Consumers CAS this forward.
    index: AtomicUsize,
}

#[repr(C)]
struct Ring<T> {
    producer: ProducerState,
    producer_cache: ProducerIndexCache,
    consumer: ConsumerState,
    slots: SlotArray<FlagSlot<T>>,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            producer: ProducerState {
                index: AtomicUsize::new(0),
            },
            producer_cache: ProducerIndexCache {
                index: AtomicUsize::new(0),
            },
            consumer: ConsumerState {
                index: AtomicUsize::new(0),
            },
            slots: SlotArray::new(capacity, |_| FlagSlot::new()),
        }
    }

    /// # Safety
    ///
    /// Only the single producer may call this.
    #[inline]
    unsafe fn offer(&self, item: T) -> Result<(), T> {
        let index = self.producer.index.load(Ordering::Relaxed);
        let slot = self.slots.slot(index);
        if slot.is_full() {
            let size = index.wrapping_sub(self.consumer.index.load(Ordering::Acquire));
            if size > self.slots.mask() {
                return Err(item);
            }
            // A consumer claimed this slot and is still reading it.
            while slot.is_full() {
                std::hint::spin_loop();
            }
        }
        // SAFETY: the slot is empty and only the producer writes slots.
        unsafe { slot.put(item) };
        self.producer
            .index
            .store(index.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Claims the next index for a consumer.
    ///
    /// With `refresh` the real producer index is consulted when the shared
    /// snapshot is exhausted; without it an exhausted snapshot means empty.
    #[inline]
    fn claim(&self, refresh: bool) -> Option<usize> {
        let mut produced = self.producer_cache.index.load(Ordering::Acquire);
        loop {
            let index = self.consumer.index.load(Ordering::Acquire);
            if index.wrapping_sub(produced) as isize >= 0 {
                if !refresh {
                    return None;
                }
                let current = self.producer.index.load(Ordering::Acquire);
                if index.wrapping_sub(current) as isize >= 0 {
                    return None;
                }
                self.producer_cache.index.store(current, Ordering::Release);
                produced = current;
            }
            if self
                .consumer
                .index
                .compare_exchange_weak(
                    index,
                    index.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    #[inline]
    fn poll(&self, refresh: bool) -> Option<T> {
        let index = self.claim(refresh)?;
        // SAFETY: index < producer index, so the slot was written before the producer
        // index was published, and winning the CAS makes us its only reader.
        Some(unsafe { self.slots.slot(index).take() })
    }

    /// Optimistic peek, validated by re-reading the consumer index after the copy.
    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let index = self.consumer.index.load(Ordering::Acquire);
            if index.wrapping_sub(self.producer.index.load(Ordering::Acquire)) as isize >= 0 {
                return None;
            }
            let value = self.slots.slot(index).read_racy();
            fence(Ordering::Acquire);
            if self.consumer.index.load(Ordering::Relaxed) == index {
                // SAFETY: nobody claimed `index` during the copy, so the slot still held
                // the fully written element the producer published.
                return Some(unsafe { value.assume_init() });
            }
        }
    }

    fn len(&self) -> usize {
        current_len(
            &self.producer.index,
            &self.consumer.index,
            self.slots.capacity(),
        )
    }
}

/// Write end of the SPMC queue.
///
/// `Producer` is [`Send`] but **not** [`Sync`] or [`Clone`].
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPMC queue. Clone it to add consumers.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Creates a new SPMC queue holding at least `capacity` elements.
///
/// # Errors
///
/// Returns [`QueueError`] if `capacity` is zero or cannot be rounded up.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    let capacity = queue_capacity(capacity, 1)?;
    let ring = Arc::new(Ring::new(capacity));

    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };
    let consumer = Consumer { ring };
    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Attempts to enqueue an item.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn offer(&self, item: T) -> Result<(), T> {
        // SAFETY: Producer is the only handle on the producer side and is !Sync.
        unsafe { self.ring.offer(item) }
    }

    /// Same as [`offer`](Self::offer).
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

    /// Enqueues up to `limit` elements. Returns the number added.
    ///
    /// `supplier` is only called once a slot has been found free.
    pub fn fill(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        let ring = &self.ring;
        for filled in 0..limit {
            let index = ring.producer.index.load(Ordering::Relaxed);
            let slot = ring.slots.slot(index);
            if slot.is_full() {
                return filled;
            }
            // SAFETY: observed empty; only the producer writes slots.
            unsafe { slot.put(supplier()) };
            ring.producer
                .index
                .store(index.wrapping_add(1), Ordering::Release);
        }
        limit
    }

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

    #[must_use]
    pub fn producer_index(&self) -> usize {
        self.ring.producer.index.load(Ordering::Acquire)
    }
}

impl<T: Send> Consumer<T> {
    /// Dequeues the next item, or returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> Option<T> {
        self.ring.poll(true)
    }

    /// Dequeues using only the shared producer snapshot.
    ///
    /// May report empty while the producer has published more; never touches
    /// the producer's cache line.
    #[inline]
    #[must_use]
    pub fn relaxed_poll(&self) -> Option<T> {
        self.ring.poll(false)
    }

    /// Copies the next element without removing it.
    ///
    /// Another consumer may take the element right after this returns.
    #[must_use]
    pub fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        self.ring.peek()
    }

    /// Spins until an item is available, then dequeues it.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn poll_blocking(&self, timeout: Timeout) -> Option<T> {
        poll_until(timeout, || self.poll())
    }

    /// Hands up to `limit` elements to `f`. Returns how many were drained.
    pub fn drain(&self, mut f: impl FnMut(T), limit: usize) -> usize {
        for drained in 0..limit {
            match self.poll() {
                Some(item) => f(item),
                None => return drained,
            }
        }
        limit
    }

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

    #[must_use]
    pub fn consumer_index(&self) -> usize {
        self.ring.consumer.index.load(Ordering::Acquire)
    }
}
