//! Pre-allocated event storage fronting a sequencer.
//!
//! Every slot is filled once by an [`EventFactory`] when the ring is built
//! and then reused in place: producers claim a sequence, mutate the event in
//! that slot and publish it. Consumers read it through a
//! [`SequenceBarrier`] and their gating sequence keeps producers from
//! reusing the slot until every consumer is done with it.
//!
//! The closure publishers are the safe way in. On a single-producer ring they
//! also check that no two of them overlap, since the sequencer itself cannot
//! tell two producing threads apart.
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::disruptor::{BusySpinWaitStrategy, RingBuffer};
//!
//! let ring = RingBuffer::create_single_producer(|| 0u64, 8, Arc::new(BusySpinWaitStrategy))?;
//! let sequence = ring.publish_event(|event, sequence| *event = sequence as u64 * 10);
//! let barrier = ring.new_barrier(&[]);
//! assert_eq!(barrier.wait_for(sequence), Ok(0));
//! // SAFETY: sequence 0 is published and no producer can wrap onto it yet.
//! assert_eq!(unsafe { *ring.get(0) }, 0);
//! # Ok::<(), turnstile::disruptor::ConfigError>(())
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::barrier::SequenceBarrier;
use super::config::{ProducerType, RingBufferConfig};
use super::error::{ClaimError, ConfigError, InsufficientCapacity};
use super::sequencer::Sequencer;
use super::wait_strategy::WaitStrategy;
use crate::sequence::{Sequence, SequenceReader};
use crate::slots::SlotArray;

/// Creates the events a ring buffer is pre-filled with.
pub trait EventFactory<E> {
    fn new_instance(&self) -> E;
}

impl<E, F> EventFactory<E> for F
where
    F: Fn() -> E,
{
    #[inline]
    fn new_instance(&self) -> E {
        self()
    }
}

pub struct RingBuffer<E> {
    entries: SlotArray<UnsafeCell<E>>,
    sequencer: Arc<dyn Sequencer>,
    single_producer: bool,
    publishing: AtomicBool,
}

// SAFETY: the sequencer protocol hands each slot to one producer between
// claim and publish and only to readers between publish and the slot's reuse.
// Single-producer claims are serialised by `publishing`.
// Events cross threads both ways, so they must be `Send`, and many consumers
// read one event at once, so they must be `Sync`.
unsafe impl<E: Send> Send for RingBuffer<E> {}
unsafe impl<E: Send + Sync> Sync for RingBuffer<E> {}

impl<E> RingBuffer<E> {
    /// Builds a ring over an existing sequencer, sized to match it.
    ///
    /// # Safety
    ///
    /// No other ring buffer may use `sequencer`, and any claims made on it
    /// directly must follow the [`Sequencer::next`] contract.
    pub unsafe fn with_sequencer(
        factory: impl EventFactory<E>,
        sequencer: Arc<dyn Sequencer>,
    ) -> Self {
        let entries = SlotArray::new(sequencer.buffer_size(), |_| {
            UnsafeCell::new(factory.new_instance())
        });
        Self {
            entries,
            single_producer: sequencer.producer_type() == ProducerType::Single,
            sequencer,
            publishing: AtomicBool::new(false),
        }
    }

    /// # Errors
    ///
    /// [`ConfigError`] unless `buffer_size` is a supported power of two.
    pub fn new(
        factory: impl EventFactory<E>,
        buffer_size: usize,
        producer_type: ProducerType,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        let sequencer = producer_type.sequencer(buffer_size, wait_strategy)?;
        // SAFETY: the sequencer was just created and is not shared.
        Ok(unsafe { Self::with_sequencer(factory, sequencer) })
    }

    /// # Errors
    ///
    /// [`ConfigError`] unless `buffer_size` is a supported power of two.
    pub fn create_single_producer(
        factory: impl EventFactory<E>,
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        Self::new(factory, buffer_size, ProducerType::Single, wait_strategy)
    }

    /// # Errors
    ///
    /// [`ConfigError`] unless `buffer_size` is a supported power of two.
    pub fn create_multi_producer(
        factory: impl EventFactory<E>,
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        Self::new(factory, buffer_size, ProducerType::Multi, wait_strategy)
    }

    /// # Errors
    ///
    /// [`ConfigError`] if `config` does not validate.
    pub fn from_config(
        config: &RingBufferConfig,
        factory: impl EventFactory<E>,
    ) -> Result<Self, ConfigError> {
        let sequencer = config.build_sequencer()?;
        // SAFETY: the sequencer was just created and is not shared.
        Ok(unsafe { Self::with_sequencer(factory, sequencer) })
    }

    /// Event at `sequence`.
    ///
    /// # Safety
    ///
    /// `sequence` must be published and the caller must hold it back from
    /// reuse, normally by not yet advancing a gating sequence past it.
    #[inline]
    #[must_use]
    pub unsafe fn get(&self, sequence: i64) -> &E {
        // SAFETY: the caller guarantees no producer holds this slot.
        unsafe { &*self.entries.slot(sequence).get() }
    }

    /// Mutable event at `sequence`.
    ///
    /// # Safety
    ///
    /// `sequence` must be claimed by the caller and not yet published, and no
    /// other reference to the event may be alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub unsafe fn get_mut(&self, sequence: i64) -> &mut E {
        // SAFETY: the caller owns the claimed slot exclusively.
        unsafe { &mut *self.entries.slot(sequence).get() }
    }

    /// Claims one slot, lets `update` fill it and publishes it.
    ///
    /// Waits while the ring is full. The slot is published even if `update`
    /// panics. Returns the published sequence.
    ///
    /// # Panics
    ///
    /// On a single-producer ring, if another publish is already in progress,
    /// including one from inside `update`.
    pub fn publish_event<F>(&self, update: F) -> i64
    where
        F: FnOnce(&mut E, i64),
    {
        let _turn = self.producer_turn();
        // SAFETY: `_turn` makes this the only single-producer claimant.
        let sequence = unsafe { self.sequencer.next() };
        self.translate_one(sequence, update);
        sequence
    }

    /// Like [`publish_event`](Self::publish_event) but fails instead of waiting.
    ///
    /// # Errors
    ///
    /// [`InsufficientCapacity`] when the ring is full.
    ///
    /// # Panics
    ///
    /// As for [`publish_event`](Self::publish_event).
    pub fn try_publish_event<F>(&self, update: F) -> Result<i64, InsufficientCapacity>
    where
        F: FnOnce(&mut E, i64),
    {
        let _turn = self.producer_turn();
        // SAFETY: `_turn` makes this the only single-producer claimant.
        let sequence = unsafe { self.sequencer.try_next() }?;
        self.translate_one(sequence, update);
        Ok(sequence)
    }

    /// Claims `n` slots, calls `update` on each in order and publishes them together.
    ///
    /// Returns the highest published sequence.
    ///
    /// # Errors
    ///
    /// [`ClaimError::InvalidCount`] unless `1 <= n <= buffer_size`.
    ///
    /// # Panics
    ///
    /// As for [`publish_event`](Self::publish_event).
    pub fn publish_events<F>(&self, n: usize, update: F) -> Result<i64, ClaimError>
    where
        F: FnMut(&mut E, i64),
    {
        let _turn = self.producer_turn();
        // SAFETY: `_turn` makes this the only single-producer claimant.
        let hi = unsafe { self.sequencer.next_n(n) }?;
        self.translate(hi - n as i64 + 1, hi, update);
        Ok(hi)
    }

    /// Like [`publish_events`](Self::publish_events) but fails instead of waiting.
    ///
    /// # Errors
    ///
    /// [`ClaimError`] for a bad `n` or when fewer than `n` slots are free.
    ///
    /// # Panics
    ///
    /// As for [`publish_event`](Self::publish_event).
    pub fn try_publish_events<F>(&self, n: usize, update: F) -> Result<i64, ClaimError>
    where
        F: FnMut(&mut E, i64),
    {
        let _turn = self.producer_turn();
        // SAFETY: `_turn` makes this the only single-producer claimant.
        let hi = unsafe { self.sequencer.try_next_n(n) }?;
        self.translate(hi - n as i64 + 1, hi, update);
        Ok(hi)
    }

    /// Marks a closure publish in progress on a single-producer ring.
    fn producer_turn(&self) -> ProducerTurn<'_> {
        if !self.single_producer {
            return ProducerTurn(None);
        }
        assert!(
            !self.publishing.swap(true, Ordering::Acquire),
            "single-producer ring buffer published from two threads at once"
        );
        ProducerTurn(Some(&self.publishing))
    }

    fn translate_one<F>(&self, sequence: i64, update: F)
    where
        F: FnOnce(&mut E, i64),
    {
        let _publish = PublishGuard {
            sequencer: &*self.sequencer,
            lo: sequence,
            hi: sequence,
        };
        // SAFETY: claimed by this call and unpublished until the guard drops.
        update(unsafe { self.get_mut(sequence) }, sequence);
    }

    fn translate<F>(&self, lo: i64, hi: i64, mut update: F)
    where
        F: FnMut(&mut E, i64),
    {
        let _publish = PublishGuard {
            sequencer: &*self.sequencer,
            lo,
            hi,
        };
        for sequence in lo..=hi {
            // SAFETY: claimed by this call and unpublished until the guard drops.
            update(unsafe { self.get_mut(sequence) }, sequence);
        }
    }

    /// Barrier over this ring's cursor, gated on `dependencies` if any.
    #[must_use]
    pub fn new_barrier(&self, dependencies: &[SequenceReader]) -> SequenceBarrier {
        SequenceBarrier::new(Arc::clone(&self.sequencer), dependencies)
    }

    #[must_use]
    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.entries.capacity()
    }

    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor()
    }

    /// # Safety
    ///
    /// See [`Sequencer::next`]. The claim must not overlap a closure publisher.
    #[must_use]
    pub unsafe fn next(&self) -> i64 {
        // SAFETY: forwarded claim contract.
        unsafe { self.sequencer.next() }
    }

    /// # Errors
    ///
    /// See [`Sequencer::next_n`].
    ///
    /// # Safety
    ///
    /// As for [`next`](Self::next).
    pub unsafe fn next_n(&self, n: usize) -> Result<i64, ClaimError> {
        // SAFETY: forwarded claim contract.
        unsafe { self.sequencer.next_n(n) }
    }

    /// # Errors
    ///
    /// See [`Sequencer::try_next`].
    ///
    /// # Safety
    ///
    /// As for [`next`](Self::next).
    pub unsafe fn try_next(&self) -> Result<i64, InsufficientCapacity> {
        // SAFETY: forwarded claim contract.
        unsafe { self.sequencer.try_next() }
    }

    /// # Errors
    ///
    /// See [`Sequencer::try_next_n`].
    ///
    /// # Safety
    ///
    /// As for [`next`](Self::next).
    pub unsafe fn try_next_n(&self, n: usize) -> Result<i64, ClaimError> {
        // SAFETY: forwarded claim contract.
        unsafe { self.sequencer.try_next_n(n) }
    }

    /// # Safety
    ///
    /// See [`Sequencer::claim`].
    pub unsafe fn claim(&self, sequence: i64) {
        // SAFETY: forwarded contract.
        unsafe { self.sequencer.claim(sequence) };
    }

    /// # Safety
    ///
    /// See [`Sequencer::publish`].
    pub unsafe fn publish(&self, sequence: i64) {
        // SAFETY: forwarded contract.
        unsafe { self.sequencer.publish(sequence) };
    }

    /// # Safety
    ///
    /// See [`Sequencer::publish_range`].
    pub unsafe fn publish_range(&self, lo: i64, hi: i64) {
        // SAFETY: forwarded contract.
        unsafe { self.sequencer.publish_range(lo, hi) };
    }

    #[must_use]
    pub fn is_available(&self, sequence: i64) -> bool {
        self.sequencer.is_available(sequence)
    }

    #[must_use]
    pub fn highest_published_sequence(&self, lo: i64, available: i64) -> i64 {
        self.sequencer.highest_published_sequence(lo, available)
    }

    pub fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.sequencer.add_gating_sequences(sequences);
    }

    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.sequencer.remove_gating_sequence(sequence)
    }

    #[must_use]
    pub fn minimum_gating_sequence(&self) -> i64 {
        self.sequencer.minimum_sequence()
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    #[must_use]
    pub fn has_available_capacity(&self, required: usize) -> bool {
        self.sequencer.has_available_capacity(required)
    }
}

impl<E> fmt::Debug for RingBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("buffer_size", &self.buffer_size())
            .field("cursor", &self.cursor())
            .field("wait_strategy", self.sequencer.wait_strategy())
            .finish()
    }
}

/// Publishes a claimed range when dropped, including during unwinding.
struct PublishGuard<'a> {
    sequencer: &'a dyn Sequencer,
    lo: i64,
    hi: i64,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is built right after claiming `lo..=hi`.
        unsafe { self.sequencer.publish_range(self.lo, self.hi) };
    }
}

/// Clears the single-producer publishing flag on drop.
struct ProducerTurn<'a>(Option<&'a AtomicBool>);

impl Drop for ProducerTurn<'_> {
    fn drop(&mut self) {
        if let Some(publishing) = self.0 {
            publishing.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruptor::wait_strategy::{BusySpinWaitStrategy, YieldingWaitStrategy};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc;
    use std::thread;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Event {
        value: u64,
        sequence: i64,
    }

    fn ring(producer_type: ProducerType, buffer_size: usize) -> RingBuffer<Event> {
        RingBuffer::new(
            Event::default,
            buffer_size,
            producer_type,
            Arc::new(YieldingWaitStrategy::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_sizes() {
        for size in [0, 3, 1000] {
            let ring =
                RingBuffer::create_multi_producer(u64::default, size, Arc::new(BusySpinWaitStrategy));
            assert!(matches!(ring, Err(ConfigError::BufferSizeNotPowerOfTwo(_))));
        }
    }

    #[test]
    fn test_factory_prefills_every_slot() {
        let ring = RingBuffer::create_single_producer(
            || Event {
                value: 7,
                sequence: -1,
            },
            4,
            Arc::new(BusySpinWaitStrategy),
        )
        .unwrap();
        for sequence in 0..4 {
            // SAFETY: nothing is published or claimed; no producer writes.
            assert_eq!(unsafe { ring.get(sequence) }.value, 7);
        }
    }

    #[test]
    fn test_publish_event_writes_in_place() {
        for producer_type in [ProducerType::Single, ProducerType::Multi] {
            let ring = ring(producer_type, 8);
            for value in 0..10u64 {
                let sequence = ring.publish_event(|event, sequence| {
                    event.value = value;
                    event.sequence = sequence;
                });
                assert_eq!(sequence, value as i64);
            }
            assert_eq!(ring.cursor(), 9);
            // SAFETY: sequence 9 is published and nothing else publishes.
            let event = unsafe { ring.get(9) };
            assert_eq!(event.value, 9);
            assert_eq!(event.sequence, 9);
        }
    }

    #[test]
    fn test_publish_events_batches() {
        let ring = ring(ProducerType::Multi, 8);
        let hi = ring
            .publish_events(3, |event, sequence| event.value = sequence as u64 + 100)
            .unwrap();
        assert_eq!(hi, 2);
        assert_eq!(ring.highest_published_sequence(0, hi), 2);
        // SAFETY: 0..=2 are published and nothing else publishes.
        assert_eq!(unsafe { ring.get(1) }.value, 101);

        assert!(matches!(
            ring.publish_events(9, |_, _| {}),
            Err(ClaimError::InvalidCount { requested: 9, .. })
        ));
    }

    #[test]
    fn test_try_publish_fails_when_gated() {
        let ring = ring(ProducerType::Single, 4);
        let consumer = Arc::new(Sequence::default());
        ring.add_gating_sequences(&[Arc::clone(&consumer)]);

        assert_eq!(ring.try_publish_events(4, |_, _| {}), Ok(3));
        assert_eq!(ring.try_publish_event(|_, _| {}), Err(InsufficientCapacity));
        assert_eq!(ring.remaining_capacity(), 0);

        consumer.set(0);
        assert_eq!(ring.try_publish_event(|_, _| {}), Ok(4));
    }

    #[test]
    fn test_panicking_update_still_publishes() {
        let ring = ring(ProducerType::Multi, 8);
        let result = catch_unwind(AssertUnwindSafe(|| {
            ring.publish_event(|_, _| panic!("translator failed"));
        }));
        assert!(result.is_err());
        assert!(ring.is_available(0));
        assert_eq!(ring.publish_event(|_, _| {}), 1);
    }

    #[test]
    fn test_consumer_sees_published_events() {
        let ring = Arc::new(ring(ProducerType::Multi, 16));
        let consumed = Arc::new(Sequence::default());
        ring.add_gating_sequences(&[Arc::clone(&consumed)]);
        let barrier = ring.new_barrier(&[]);

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for value in 0..200u64 {
                    ring.publish_event(|event, _| event.value = value);
                }
            })
        };

        let mut next = 0;
        let mut total = 0;
        while next < 200 {
            let available = barrier.wait_for(next).unwrap();
            while next <= available {
                // SAFETY: published, and `consumed` keeps the producer off this slot.
                total += unsafe { ring.get(next) }.value;
                next += 1;
            }
            consumed.set(available);
        }
        producer.join().unwrap();
        assert_eq!(total, (0..200).sum::<u64>());
        assert_eq!(ring.minimum_gating_sequence(), 199);
    }

    #[test]
    fn test_nested_single_producer_publish_is_refused() {
        let ring = ring(ProducerType::Single, 8);
        let result = catch_unwind(AssertUnwindSafe(|| {
            ring.publish_event(|event, _| {
                event.value = 1;
                ring.publish_event(|event, _| event.value = 2);
            });
        }));
        assert!(result.is_err());

        // The outer claim was still published and the ring keeps working.
        assert_eq!(ring.cursor(), 0);
        // SAFETY: sequence 0 is published and nothing else publishes.
        assert_eq!(unsafe { ring.get(0) }.value, 1);
        assert_eq!(ring.publish_event(|_, _| {}), 1);
    }

    #[test]
    fn test_overlapping_single_producer_publish_is_refused() {
        let ring = Arc::new(ring(ProducerType::Single, 8));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                ring.publish_event(|event, _| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    event.value = 5;
                })
            })
        };

        entered_rx.recv().unwrap();
        let second = catch_unwind(AssertUnwindSafe(|| ring.try_publish_event(|_, _| {})));
        assert!(second.is_err());

        release_tx.send(()).unwrap();
        assert_eq!(producer.join().unwrap(), 0);
        assert_eq!(ring.try_publish_event(|_, _| {}), Ok(1));
    }

    #[test]
    fn test_multi_producer_publish_may_nest() {
        let ring = ring(ProducerType::Multi, 8);
        let outer = ring.publish_event(|_, _| {
            assert_eq!(ring.publish_event(|_, _| {}), 1);
        });
        assert_eq!(outer, 0);
        assert_eq!(ring.highest_published_sequence(0, 1), 1);
    }
}
