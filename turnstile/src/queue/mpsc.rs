//! Multi-producer single-consumer queue.
//!
//! # Algorithm
//!
//! - Producers CAS a shared producer index forward
//! - Before the CAS they compare against a shared *producer limit*, a cached
//!   `consumer index + capacity` that is refreshed only when it is exhausted
//! - After winning the CAS a producer writes the element and sets the slot flag
//! - The consumer advances its private index without CAS
//!
//! Winning the index and writing the slot are separate steps, so the consumer
//! can find a slot that was claimed but not yet written. `poll` then spins
//! until the write lands; `relaxed_poll` reports empty instead.
//!
//! A supplier that panics inside `fill` leaves the rest of its claimed run
//! marked as skipped. The consumer steps over skipped slots, so one faulty
//! producer never stalls the queue.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::slot::{FlagSlot, SlotState};
use super::{
    ExitCondition, IdleStrategy, PhantomUnsync, QueueError, Timeout, current_len, offer_until,
    poll_until, queue_capacity, run_rounds,
};
use crate::slots::SlotArray;

/// Producer-side state shared by every producer.
#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    /// Next index to claim.
    index: AtomicUsize,
}

/// Cached bound on `index`, on its own line since it is only written on refresh.
#[repr(C)]
#[repr(align(64))]
struct ProducerLimit {
    limit: AtomicUsize,
}

#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    /// Next index to read. Only the consumer modifies this.
    index: AtomicUsize,
}

#[repr(C)]
struct Ring<T> {
    producer: ProducerState,
    producer_limit: ProducerLimit,
    consumer: ConsumerState,
    slots: SlotArray<FlagSlot<T>>,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            producer: ProducerState {
                index: AtomicUsize::new(0),
            },
            producer_limit: ProducerLimit {
                limit: AtomicUsize::new(capacity),
            },
            consumer: ConsumerState {
                index: AtomicUsize::new(0),
            },
            slots: SlotArray::new(capacity, |_| FlagSlot::new()),
        }
    }

    /// Claims an index below the producer limit, or returns `None` if the queue is full.
    #[inline]
    fn claim(&self) -> Option<usize> {
        self.claim_batch(1).map(|(index, _)| index)
    }

    /// Claims up to `wanted` consecutive indices with one CAS.
    ///
    /// Returns the first claimed index and how many were claimed.
    fn claim_batch(&self, wanted: usize) -> Option<(usize, usize)> {
        let capacity = self.slots.capacity();
        let mut limit = self.producer_limit.limit.load(Ordering::Acquire);
        loop {
            let index = self.producer.index.load(Ordering::Acquire);
            let mut available = limit.wrapping_sub(index) as isize;
            if available <= 0 {
                let consumed = self.consumer.index.load(Ordering::Acquire);
                limit = consumed.wrapping_add(capacity);
                available = limit.wrapping_sub(index) as isize;
                if available <= 0 {
                    return None;
                }
                self.producer_limit.limit.store(limit, Ordering::Release);
            }
            let batch = wanted.min(available as usize);
            if self
                .producer
                .index
                .compare_exchange_weak(
                    index,
                    index.wrapping_add(batch),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some((index, batch));
            }
            // CAS failed: another producer moved the index, retry with a fresh one.
        }
    }

    #[inline]
    fn offer(&self, item: T) -> Result<(), T> {
        let Some(index) = self.claim() else {
            return Err(item);
        };
        // SAFETY: the CAS made us the only writer of `index`, and index < consumer + capacity
        // means the consumer already emptied this slot on the previous lap.
        unsafe { self.slots.slot(index).put(item) };
        Ok(())
    }

    fn fill(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let Some((start, batch)) = self.claim_batch(limit) else {
            return 0;
        };
        let mut run = ClaimedRun {
            slots: &self.slots,
            next: start,
            remaining: batch,
        };
        while run.remaining > 0 {
            let item = supplier();
            // SAFETY: see offer; the whole batch was claimed with one CAS.
            unsafe { self.slots.slot(run.next).put(item) };
            run.next = run.next.wrapping_add(1);
            run.remaining -= 1;
        }
        batch
    }

    /// Waits for the slot at the consumer index to be published, unless
    /// `wait_for_claimed` is false or no producer has claimed it.
    #[inline]
    fn published_state(&self, index: usize, wait_for_claimed: bool) -> Option<SlotState> {
        let slot = self.slots.slot(index);
        loop {
            match slot.state() {
                SlotState::Empty => {
                    if !wait_for_claimed || index == self.producer.index.load(Ordering::Acquire) {
                        return None;
                    }
                    // Claimed by a producer that hasn't written yet.
                    std::hint::spin_loop();
                }
                state => return Some(state),
            }
        }
    }

    /// Steps the consumer over a skipped slot.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this, after observing
    /// [`SlotState::Skipped`] at `index`.
    #[inline]
    unsafe fn pass_skipped(&self, index: usize) {
        unsafe { self.slots.slot(index).release_skipped() };
        self.consumer
            .index
            .store(index.wrapping_add(1), Ordering::Release);
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    unsafe fn poll(&self, wait_for_claimed: bool) -> Option<T> {
        loop {
            let index = self.consumer.index.load(Ordering::Relaxed);
            match self.published_state(index, wait_for_claimed)? {
                SlotState::Full => {
                    // SAFETY: full, and only the consumer reads slots.
                    let item = unsafe { self.slots.slot(index).take() };
                    self.consumer
                        .index
                        .store(index.wrapping_add(1), Ordering::Release);
                    return Some(item);
                }
                // SAFETY: single consumer, skipped state observed.
                _ => unsafe { self.pass_skipped(index) },
            }
        }
    }

    /// # Safety
    ///
    /// Only the single consumer may call this, and it must not poll while the
    /// returned reference is alive.
    unsafe fn peek(&self) -> Option<&T> {
        loop {
            let index = self.consumer.index.load(Ordering::Relaxed);
            match self.published_state(index, true)? {
                // SAFETY: full, and producers won't reuse it until the consumer takes it.
                SlotState::Full => return Some(unsafe { self.slots.slot(index).get() }),
                // SAFETY: single consumer, skipped state observed.
                _ => unsafe { self.pass_skipped(index) },
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

/// Indices claimed by `fill` that the supplier has not yet produced for.
///
/// Dropping it with slots left over (the supplier panicked) publishes them as
/// skipped so the consumer never waits on them.
struct ClaimedRun<'a, T> {
    slots: &'a SlotArray<FlagSlot<T>>,
    next: usize,
    remaining: usize,
}

impl<T> Drop for ClaimedRun<'_, T> {
    fn drop(&mut self) {
        while self.remaining > 0 {
            // SAFETY: the index is still ours from the batch claim, and it was
            // emptied on the previous lap.
            unsafe { self.slots.slot(self.next).skip() };
            self.next = self.next.wrapping_add(1);
            self.remaining -= 1;
        }
    }
}

/// Write end of the MPSC queue. Clone it to add producers.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the MPSC queue.
///
/// `Consumer` is [`Send`] but **not** [`Sync`] or [`Clone`].
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new MPSC queue holding at least `capacity` elements.
///
/// # Errors
///
/// Returns [`QueueError`] if `capacity` is zero or cannot be rounded up.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    let capacity = queue_capacity(capacity, 1)?;
    let ring = Arc::new(Ring::new(capacity));

    let producer = Producer {
        ring: Arc::clone(&ring),
    };
    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };
    Ok((producer, consumer))
}

impl<T: Send> Producer<T> {
    /// Attempts to enqueue an item. Lock-free across producers.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn offer(&self, item: T) -> Result<(), T> {
        self.ring.offer(item)
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
        offer_until(item, timeout, |item| self.ring.offer(item))
    }

    /// Claims up to `limit` slots with one CAS and fills them from `supplier`.
    ///
    /// Returns the number of elements added, which may be less than `limit`
    /// when fewer slots are free.
    pub fn fill(&self, supplier: impl FnMut() -> T, limit: usize) -> usize {
        self.ring.fill(supplier, limit)
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

    /// Total number of indices claimed by all producers.
    #[must_use]
    pub fn producer_index(&self) -> usize {
        self.ring.producer.index.load(Ordering::Acquire)
    }
}

impl<T: Send> Consumer<T> {
    /// Dequeues the next item, or returns `None` if the queue is empty.
    ///
    /// If a producer has claimed the next slot but not finished writing it,
    /// this spins until the write is visible.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> Option<T> {
        // SAFETY: Consumer is the only handle on the consumer side and is !Sync.
        unsafe { self.ring.poll(true) }
    }

    /// Dequeues the next item if it is already visible. Never spins.
    #[inline]
    #[must_use]
    pub fn relaxed_poll(&self) -> Option<T> {
        // SAFETY: see poll.
        unsafe { self.ring.poll(false) }
    }

    /// Returns a reference to the next element without removing it.
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
        poll_until(timeout, || self.relaxed_poll())
    }

    /// Hands up to `limit` visible elements to `f`. Stops at the first slot
    /// that is empty or still being written.
    pub fn drain(&self, mut f: impl FnMut(T), limit: usize) -> usize {
        for drained in 0..limit {
            match self.relaxed_poll() {
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

    /// Drops every element currently queued, waiting out in-flight writes.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;

    #[test]
    fn test_single_producer_single_consumer() {
        let (producer, consumer) = channel::<u64>(8).unwrap();

        assert!(producer.offer(1).is_ok());
        assert!(producer.offer(2).is_ok());
        assert!(producer.offer(3).is_ok());

        assert_eq!(consumer.poll(), Some(1));
        assert_eq!(consumer.poll(), Some(2));
        assert_eq!(consumer.poll(), Some(3));
        assert_eq!(consumer.poll(), None);
    }

    #[test]
    fn test_queue_full() {
        let (producer, consumer) = channel::<u64>(4).unwrap();

        for i in 1..=4 {
            assert!(producer.offer(i).is_ok());
        }
        // Should be full now
        assert_eq!(producer.offer(5), Err(5));

        // Pop one, should be able to offer again after the limit refresh
        assert_eq!(consumer.poll(), Some(1));
        assert!(producer.offer(5).is_ok());
        assert_eq!(producer.offer(6), Err(6)); // Full again
    }

    #[test]
    fn test_capacity_one() {
        let (producer, mut consumer) = channel::<u64>(1).unwrap();
        assert_eq!(producer.capacity(), 1);

        producer.offer(7).unwrap();
        assert_eq!(producer.offer(8), Err(8));
        assert_eq!(consumer.peek(), Some(&7));
        assert_eq!(consumer.poll(), Some(7));
        producer.offer(8).unwrap();
        assert_eq!(consumer.poll(), Some(8));
    }

    #[test]
    fn test_fill_claims_available_batch() {
        let (producer, consumer) = channel::<u64>(8).unwrap();
        producer.offer(100).unwrap();

        let mut next = 0;
        let filled = producer.fill(
            || {
                next += 1;
                next
            },
            20,
        );
        assert_eq!(filled, 7);
        assert_eq!(producer.fill(|| 0, 1), 0);

        let mut drained = Vec::new();
        assert_eq!(consumer.drain_all(|item| drained.push(item)), 8);
        assert_eq!(drained, vec![100, 1, 2, 3, 4, 5, 6, 7]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_claimed_but_unwritten_slot() {
        let (producer, consumer) = channel::<u64>(4).unwrap();

        // Simulate a producer that won the CAS but was descheduled before writing.
        let index = producer.ring.claim().unwrap();
        assert_eq!(index, 0);
        assert_eq!(consumer.relaxed_poll(), None);
        assert_eq!(consumer.len(), 1);

        let writer = {
            let ring = Arc::clone(&producer.ring);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                // SAFETY: this thread owns the claim made above.
                unsafe { ring.slots.slot(index).put(55) };
            })
        };

        // poll spins until the write lands.
        assert_eq!(consumer.poll(), Some(55));
        writer.join().unwrap();
    }

    #[test]
    fn test_multiple_producers() {
        let (producer, consumer) = channel::<u64>(64).unwrap();
        let num_producers = 4;
        let items_per_producer = 1000;

        let handles: Vec<_> = (0..num_producers)
            .map(|p| {
                let producer = producer.clone();
                thread::spawn(move || {
                    for i in 0..items_per_producer {
                        let value = (p * 10_000 + i) as u64;
                        while producer.offer(value).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut items = Vec::with_capacity(num_producers * items_per_producer);
        let mut last_seen = vec![None::<u64>; num_producers];
        while items.len() < num_producers * items_per_producer {
            match consumer.poll() {
                Some(item) => {
                    // Per-producer FIFO order.
                    let p = (item / 10_000) as usize;
                    assert!(last_seen[p].is_none_or(|last| last < item));
                    last_seen[p] = Some(item);
                    items.push(item);
                }
                None => thread::yield_now(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), num_producers * items_per_producer);
    }

    #[test]
    fn test_panicking_supplier_leaves_no_gap() {
        let (producer, consumer) = channel::<String>(8).unwrap();
        producer.offer("before".to_owned()).unwrap();

        let mut calls = 0;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            producer.fill(
                || {
                    calls += 1;
                    if calls == 3 {
                        panic!("supplier failed");
                    }
                    calls.to_string()
                },
                4,
            )
        }));
        assert!(result.is_err());
        assert_eq!(producer.producer_index(), 5);

        producer.offer("after".to_owned()).unwrap();
        assert_eq!(consumer.poll().as_deref(), Some("before"));
        assert_eq!(consumer.poll().as_deref(), Some("1"));
        assert_eq!(consumer.poll().as_deref(), Some("2"));
        assert_eq!(consumer.poll().as_deref(), Some("after"));
        assert_eq!(consumer.poll(), None);

        // Skipped slots are reusable on the next lap.
        for i in 0..8 {
            assert!(producer.offer(i.to_string()).is_ok());
        }
        assert_eq!(consumer.drain_all(drop), 8);
    }
}
