//! Multi-producer multi-consumer queue.
//!
//! # Algorithm
//!
//! Dmitry Vyukov's bounded queue. Every slot carries a turn counter that says
//! which index may touch it next:
//!
//! - `turn == index`: free, the producer of `index` may claim it
//! - `turn == index + 1`: written, the consumer of `index` may claim it
//! - `turn == index + C`: read, free for the producer one lap later
//!
//! Producers and consumers each CAS their own index and then hand the slot
//! over by advancing its turn, so the two sides never contend on one word.
//!
//! `drain` and `fill` use look-ahead batching. When the slot `step - 1`
//! positions ahead already has the expected turn, the whole run is claimed
//! with one CAS. Each slot in the run is then waited on individually, because
//! its neighbour may still be in flight.
//!
//! User code runs while indices are claimed: the supplier in `fill` and the
//! callback in `drain`. If either panics, a guard hands the rest of the run
//! over before unwinding continues. Unfilled producer slots are published as
//! holes that consumers skip, and unread consumer slots are dropped and freed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use super::slot::TurnSlot;
use super::{
    ExitCondition, IdleStrategy, QueueError, Timeout, current_len, look_ahead_step, offer_until,
    poll_until, queue_capacity, run_rounds,
};
use crate::slots::SlotArray;

/// Smallest capacity an MPMC queue is built with.
pub const MIN_CAPACITY: usize = 2;

#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    index: AtomicUsize,
}

#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    index: AtomicUsize,
}

#[repr(C)]
struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    look_ahead_step: usize,
    slots: SlotArray<TurnSlot<T>>,
}

/// Signed distance from `expected` to `turn`, robust to counter wrap.
#[inline]
fn distance(turn: usize, expected: usize) -> isize {
    turn.wrapping_sub(expected) as isize
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            producer: ProducerState {
                index: AtomicUsize::new(0),
            },
            consumer: ConsumerState {
                index: AtomicUsize::new(0),
            },
            look_ahead_step: look_ahead_step(capacity, MIN_CAPACITY),
            slots: SlotArray::new(capacity, TurnSlot::new),
        }
    }

    /// Claims a producer index whose slot is free.
    ///
    /// `strict` distinguishes "full" from "a consumer is still freeing this slot"
    /// by reading the consumer index; relaxed claims give up on either.
    #[inline]
    fn claim_producer(&self, strict: bool) -> Option<usize> {
        let capacity = self.slots.capacity();
        loop {
            let index = self.producer.index.load(Ordering::Acquire);
            let turn = self.slots.slot(index).turn.load(Ordering::Acquire);
            let diff = distance(turn, index);
            if diff == 0 {
                if self
                    .producer
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
                // CAS failed: another producer beat us, retry with new index.
            } else if diff < 0 {
                // The slot still holds the element from the previous lap.
                if !strict {
                    return None;
                }
                let consumed = self.consumer.index.load(Ordering::Acquire);
                if index.wrapping_sub(consumed) >= capacity {
                    return None;
                }
                // A consumer claimed it but hasn't freed it yet.
                std::hint::spin_loop();
            }
            // diff > 0: the producer index moved past `index`; retry.
        }
    }

    /// Consumer mirror of [`claim_producer`](Self::claim_producer).
    #[inline]
    fn claim_consumer(&self, strict: bool) -> Option<usize> {
        loop {
            let index = self.consumer.index.load(Ordering::Acquire);
            let expected = index.wrapping_add(1);
            let turn = self.slots.slot(index).turn.load(Ordering::Acquire);
            let diff = distance(turn, expected);
            if diff == 0 {
                if self
                    .consumer
                    .index
                    .compare_exchange_weak(
                        index,
                        expected,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return Some(index);
                }
            } else if diff < 0 {
                if !strict {
                    return None;
                }
                let produced = self.producer.index.load(Ordering::Acquire);
                if distance(index, produced) >= 0 {
                    return None;
                }
                // Claimed by a producer that hasn't published yet.
                std::hint::spin_loop();
            }
        }
    }

    /// Writes `item` into the claimed producer slot and hands it to consumers.
    ///
    /// # Safety
    ///
    /// `index` must come from a successful producer claim.
    #[inline]
    unsafe fn publish(&self, index: usize, item: T) {
        let slot = self.slots.slot(index);
        // SAFETY: the claim gives us exclusive write access for this turn.
        unsafe { slot.write(item) };
        slot.turn.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Publishes a claimed producer slot as a hole.
    ///
    /// # Safety
    ///
    /// `index` must come from a successful producer claim and must not be written.
    #[inline]
    unsafe fn publish_skipped(&self, index: usize) {
        // Consumers of the previous lap may still be reading.
        self.wait_for_turn(index, index);
        let slot = self.slots.slot(index);
        // SAFETY: forwarded producer claim.
        unsafe { slot.mark_skipped() };
        slot.turn.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Moves the element out of a claimed consumer slot and frees it for the next lap.
    ///
    /// Returns `None` for a hole left by a panicking supplier.
    ///
    /// # Safety
    ///
    /// `index` must come from a successful consumer claim.
    #[inline]
    unsafe fn consume(&self, index: usize) -> Option<T> {
        let slot = self.slots.slot(index);
        let item = if slot.is_skipped() {
            // SAFETY: forwarded consumer claim.
            unsafe { slot.clear_skipped() };
            None
        } else {
            // SAFETY: the claim gives us exclusive read access, and turn == index + 1
            // means the producer finished writing.
            Some(unsafe { slot.read() })
        };
        slot.turn
            .store(index.wrapping_add(self.slots.capacity()), Ordering::Release);
        item
    }

    fn offer(&self, item: T, strict: bool) -> Result<(), T> {
        match self.claim_producer(strict) {
            // SAFETY: index was just claimed.
            Some(index) => unsafe {
                self.publish(index, item);
                Ok(())
            },
            None => Err(item),
        }
    }

    fn poll(&self, strict: bool) -> Option<T> {
        loop {
            let index = self.claim_consumer(strict)?;
            // SAFETY: index was just claimed.
            if let Some(item) = unsafe { self.consume(index) } {
                return Some(item);
            }
        }
    }

    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let index = self.consumer.index.load(Ordering::Acquire);
            let expected = index.wrapping_add(1);
            let slot = self.slots.slot(index);
            let turn = slot.turn.load(Ordering::Acquire);
            let diff = distance(turn, expected);
            if diff == 0 {
                if slot.is_skipped() {
                    // Retire the hole so the next element becomes visible.
                    if self
                        .consumer
                        .index
                        .compare_exchange(index, expected, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        // SAFETY: the CAS claimed `index`.
                        let _ = unsafe { self.consume(index) };
                    }
                    continue;
                }
                let value = slot.read_racy();
                fence(Ordering::Acquire);
                if slot.turn.load(Ordering::Relaxed) == expected {
                    // SAFETY: the turn didn't move during the copy, so no consumer
                    // freed the slot and no producer rewrote it.
                    return Some(unsafe { value.assume_init() });
                }
            } else if diff < 0 {
                let produced = self.producer.index.load(Ordering::Acquire);
                if distance(index, produced) >= 0 {
                    return None;
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Waits until `index`'s slot reaches `turn`. Used inside claimed look-ahead runs.
    #[inline]
    fn wait_for_turn(&self, index: usize, turn: usize) {
        let slot = self.slots.slot(index);
        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }
    }

    fn drain(&self, mut f: impl FnMut(T), limit: usize) -> usize {
        let step = self.look_ahead_step.min(limit);
        let mut drained = 0;
        while drained < limit {
            let want = step.min(limit - drained);
            let index = self.consumer.index.load(Ordering::Acquire);
            let look_ahead = index.wrapping_add(want - 1);
            let ready = self.slots.slot(look_ahead).turn.load(Ordering::Acquire)
                == look_ahead.wrapping_add(1);
            if want > 1
                && ready
                && self
                    .consumer
                    .index
                    .compare_exchange(
                        index,
                        index.wrapping_add(want),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                let mut run = ClaimedRun::consumer(self, index, want);
                while let Some(item) = run.consume_next() {
                    f(item);
                    drained += 1;
                }
            } else {
                match self.poll(false) {
                    Some(item) => {
                        f(item);
                        drained += 1;
                    }
                    None => return drained,
                }
            }
        }
        drained
    }

    fn fill(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        let step = self.look_ahead_step.min(limit);
        let mut filled = 0;
        while filled < limit {
            let want = step.min(limit - filled);
            let index = self.producer.index.load(Ordering::Acquire);
            let look_ahead = index.wrapping_add(want - 1);
            let free = self.slots.slot(look_ahead).turn.load(Ordering::Acquire) == look_ahead;
            let claimed = if want > 1
                && free
                && self
                    .producer
                    .index
                    .compare_exchange(
                        index,
                        index.wrapping_add(want),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                ClaimedRun::producer(self, index, want)
            } else {
                match self.claim_producer(false) {
                    Some(index) => ClaimedRun::producer(self, index, 1),
                    None => return filled,
                }
            };
            filled += claimed.remaining;
            claimed.publish_from(&mut supplier);
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

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut index = *self.consumer.index.get_mut();
        let end = *self.producer.index.get_mut();
        while index != end {
            // SAFETY: with every handle gone, each index in [consumer, producer) holds a
            // published element or hole that nobody will read.
            let slot = self.slots.slot(index);
            if !slot.is_skipped() {
                drop(unsafe { slot.read() });
            }
            index = index.wrapping_add(1);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Producer,
    Consumer,
}

/// A run of indices claimed with one CAS and not yet handed over.
///
/// Dropping it with indices left (user code panicked mid-run) finishes the
/// hand-over: producer slots become holes, consumer slots are dropped and freed.
struct ClaimedRun<'a, T> {
    ring: &'a Ring<T>,
    side: Side,
    next: usize,
    remaining: usize,
}

impl<'a, T> ClaimedRun<'a, T> {
    fn producer(ring: &'a Ring<T>, next: usize, remaining: usize) -> Self {
        Self {
            ring,
            side: Side::Producer,
            next,
            remaining,
        }
    }

    fn consumer(ring: &'a Ring<T>, next: usize, remaining: usize) -> Self {
        Self {
            ring,
            side: Side::Consumer,
            next,
            remaining,
        }
    }

    fn publish_from(mut self, supplier: &mut impl FnMut() -> T) {
        while self.remaining > 0 {
            let index = self.next;
            // Consumers of the previous lap may still be reading.
            self.ring.wait_for_turn(index, index);
            let item = supplier();
            // SAFETY: the run owns `index` and its slot is free for this lap.
            unsafe { self.ring.publish(index, item) };
            self.next = index.wrapping_add(1);
            self.remaining -= 1;
        }
    }

    /// Takes the next element of the run, stepping over holes.
    fn consume_next(&mut self) -> Option<T> {
        while self.remaining > 0 {
            let index = self.next;
            // Producers of earlier indices may still be writing.
            self.ring.wait_for_turn(index, index.wrapping_add(1));
            self.next = index.wrapping_add(1);
            self.remaining -= 1;
            // SAFETY: the run owns `index` and its turn shows it published.
            if let Some(item) = unsafe { self.ring.consume(index) } {
                return Some(item);
            }
        }
        None
    }
}

impl<T> Drop for ClaimedRun<'_, T> {
    fn drop(&mut self) {
        match self.side {
            Side::Producer => {
                while self.remaining > 0 {
                    // SAFETY: the run owns `next` and nothing was written to it.
                    unsafe { self.ring.publish_skipped(self.next) };
                    self.next = self.next.wrapping_add(1);
                    self.remaining -= 1;
                }
            }
            Side::Consumer => while self.consume_next().is_some() {},
        }
    }
}

/// Write end of the MPMC queue. Clone it to add producers.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
}

/// Read end of the MPMC queue. Clone it to add consumers.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Creates a new MPMC queue holding at least `capacity` elements.
///
/// Capacity is rounded up to a power of two, and to at least [`MIN_CAPACITY`].
///
/// # Errors
///
/// Returns [`QueueError`] if `capacity` is zero or cannot be rounded up.
pub fn channel<T: Send>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
    let capacity = queue_capacity(capacity, MIN_CAPACITY)?;
    let ring = Arc::new(Ring::new(capacity));
    Ok((
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    ))
}

impl<T: Send> Producer<T> {
    /// Attempts to enqueue an item.
    ///
    /// Fails only if the queue was full at the moment of the check: a slot
    /// that a consumer has claimed but not yet freed is waited for.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn offer(&self, item: T) -> Result<(), T> {
        self.ring.offer(item, true)
    }

    /// Enqueues only if the next slot is already free.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the slot is occupied, even if a consumer is about to free it.
    #[inline]
    pub fn relaxed_offer(&self, item: T) -> Result<(), T> {
        self.ring.offer(item, false)
    }

    /// Spins until space is available, then enqueues.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn offer_blocking(&self, item: T, timeout: Timeout) -> Result<(), T> {
        offer_until(item, timeout, |item| self.ring.offer(item, false))
    }

    /// Enqueues up to `limit` elements, claiming look-ahead runs with one CAS.
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

    #[must_use]
    pub fn producer_index(&self) -> usize {
        self.ring.producer.index.load(Ordering::Acquire)
    }
}

impl<T: Send> Consumer<T> {
    /// Dequeues the next item, or returns `None` if the queue is empty.
    ///
    /// If a producer has claimed the next slot but not yet published it, this
    /// waits for the publish.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> Option<T> {
        self.ring.poll(true)
    }

    /// Dequeues only if the next slot is already published.
    #[inline]
    #[must_use]
    pub fn relaxed_poll(&self) -> Option<T> {
        self.ring.poll(false)
    }

    /// Copies the next element without removing it.
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
        poll_until(timeout, || self.ring.poll(false))
    }

    /// Hands up to `limit` elements to `f`, claiming look-ahead runs with one CAS.
    pub fn drain(&self, f: impl FnMut(T), limit: usize) -> usize {
        self.ring.drain(f, limit)
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
