//! Sequence claiming and publication.
//!
//! A sequencer hands out ring buffer sequences to producers and tells
//! consumers which ones are safe to read. It never lets the cursor run more
//! than `buffer_size` ahead of the slowest gating sequence.
//!
//! Two flavours share the [`Sequencer`] trait:
//!
//! * [`SingleProducerSequencer`]: one claiming thread, the cursor is the
//!   highest *published* sequence.
//! * [`MultiProducerSequencer`]: any number of claiming threads racing on a
//!   CAS, the cursor is the highest *claimed* sequence and a per-slot
//!   availability array records what has been published.

mod multi;
mod single;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use multi::MultiProducerSequencer;
pub use single::SingleProducerSequencer;

use super::config::ProducerType;
use super::error::{ClaimError, ConfigError, InsufficientCapacity};
use super::sequence_group::SequenceGroup;
use super::wait_strategy::WaitStrategy;
use crate::sequence::{Sequence, SequenceReader};

/// Largest ring a sequencer accepts.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;

/// Producer-side coordination of a ring buffer.
///
/// Claims return the *highest* claimed sequence; a claim of `n` covers
/// `hi - n + 1 ..= hi`. Every claimed sequence must be published exactly once.
///
/// Claiming and publishing are `unsafe`: a [`RingBuffer`](super::RingBuffer)
/// hands out `&mut` access to a slot on the strength of a claim, and consumers
/// read a slot on the strength of a publish. Safe code publishes through the
/// ring buffer's closure publishers instead.
///
/// # Safety
///
/// Implementations must uphold what ring buffers and barriers rely on:
///
/// * while callers honour the claim contract, no sequence is handed to two
///   claimants before it is published, and no claim comes within
///   `buffer_size` of the slowest gating sequence;
/// * [`highest_published_sequence`](Self::highest_published_sequence) and
///   [`is_available`](Self::is_available) only report sequences that were
///   published on their current lap;
/// * [`producer_type`](Self::producer_type) is
///   [`ProducerType::Multi`] only if concurrent claims from many threads are
///   sound.
pub unsafe trait Sequencer: Send + Sync {
    fn buffer_size(&self) -> usize;

    /// Read-only handle to the producer cursor.
    fn cursor_sequence(&self) -> SequenceReader;

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy>;

    /// Whether claims may come from several threads at once.
    fn producer_type(&self) -> ProducerType;

    /// Current cursor value.
    fn cursor(&self) -> i64 {
        self.cursor_sequence().get()
    }

    /// Claims the next sequence, waiting for consumers if the ring is full.
    ///
    /// # Safety
    ///
    /// On a [`ProducerType::Single`] sequencer, claims and publishes must come
    /// from one thread at a time, never overlap a ring buffer closure
    /// publisher, and every claim must be published before the next one.
    unsafe fn next(&self) -> i64;

    /// Claims `n` sequences, waiting for consumers if the ring is full.
    ///
    /// # Errors
    ///
    /// [`ClaimError::InvalidCount`] unless `1 <= n <= buffer_size`.
    ///
    /// # Safety
    ///
    /// See [`next`](Self::next).
    unsafe fn next_n(&self, n: usize) -> Result<i64, ClaimError>;

    /// Claims the next sequence if a slot is free right now.
    ///
    /// # Errors
    ///
    /// [`InsufficientCapacity`] when the ring is full.
    ///
    /// # Safety
    ///
    /// See [`next`](Self::next).
    unsafe fn try_next(&self) -> Result<i64, InsufficientCapacity> {
        // SAFETY: forwarded claim contract.
        unsafe { self.try_next_n(1) }.map_err(|_| InsufficientCapacity)
    }

    /// Claims `n` sequences if that many slots are free right now.
    ///
    /// # Errors
    ///
    /// [`ClaimError::InvalidCount`] for a bad `n`,
    /// [`ClaimError::InsufficientCapacity`] when there is not enough room.
    ///
    /// # Safety
    ///
    /// See [`next`](Self::next).
    unsafe fn try_next_n(&self, n: usize) -> Result<i64, ClaimError>;

    /// Moves the claim position to `sequence`. Only for initialisation and tests.
    ///
    /// # Safety
    ///
    /// No claim may be outstanding and no consumer may be reading. Sequences
    /// at or below `sequence` count as claimed, so the caller must publish
    /// `sequence` itself before consumers are started.
    unsafe fn claim(&self, sequence: i64);

    /// Makes `sequence` visible to consumers.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `sequence` from this sequencer and
    /// finished writing its slot. On a single-producer sequencer every
    /// sequence below it must be published too.
    unsafe fn publish(&self, sequence: i64);

    /// Makes `lo..=hi` visible to consumers.
    ///
    /// # Safety
    ///
    /// As for [`publish`](Self::publish), for every sequence in the range.
    unsafe fn publish_range(&self, lo: i64, hi: i64);

    /// Whether the slot for `sequence` has been published on its current lap.
    fn is_available(&self, sequence: i64) -> bool;

    /// Highest sequence in `lo..=available` below which every slot is published.
    ///
    /// Returns `lo - 1` when `lo` itself is not yet published.
    fn highest_published_sequence(&self, lo: i64, available: i64) -> i64;

    /// Adds gating sequences, moving each to the cursor first.
    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]);

    /// Removes `sequence` from the gating set. Returns whether it was present.
    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    /// Minimum of the gating set and the cursor.
    fn minimum_sequence(&self) -> i64;

    /// Number of slots producers could claim right now.
    fn remaining_capacity(&self) -> i64;

    /// Whether `required` slots are free right now.
    fn has_available_capacity(&self, required: usize) -> bool;
}

/// State every sequencer carries.
pub(crate) struct SequencerCore {
    pub(crate) buffer_size: usize,
    pub(crate) cursor: Arc<Sequence>,
    pub(crate) gating: SequenceGroup,
    pub(crate) wait_strategy: Arc<dyn WaitStrategy>,
}

impl SequencerCore {
    pub(crate) fn new(
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        validate_buffer_size(buffer_size)?;
        Ok(Self {
            buffer_size,
            cursor: Arc::new(Sequence::default()),
            gating: SequenceGroup::new(),
            wait_strategy,
        })
    }

    #[inline]
    pub(crate) fn size(&self) -> i64 {
        self.buffer_size as i64
    }

    /// Validates a claim count and widens it to sequence arithmetic.
    #[inline]
    pub(crate) fn claim_count(&self, n: usize) -> Result<i64, ClaimError> {
        if n == 0 || n > self.buffer_size {
            return Err(ClaimError::InvalidCount {
                requested: n,
                buffer_size: self.buffer_size,
            });
        }
        Ok(n as i64)
    }

    #[inline]
    pub(crate) fn signal(&self) {
        self.wait_strategy.signal_all_when_blocking();
    }
}

/// Checks that `buffer_size` is a power of two a sequencer can address.
///
/// # Errors
///
/// [`ConfigError::BufferSizeNotPowerOfTwo`] or [`ConfigError::BufferSizeTooLarge`].
pub fn validate_buffer_size(buffer_size: usize) -> Result<(), ConfigError> {
    if !buffer_size.is_power_of_two() {
        return Err(ConfigError::BufferSizeNotPowerOfTwo(buffer_size));
    }
    if buffer_size > MAX_BUFFER_SIZE {
        return Err(ConfigError::BufferSizeTooLarge(buffer_size));
    }
    Ok(())
}

/// Backoff while a claim waits for consumers to free slots.
#[inline]
pub(crate) fn park_briefly() {
    thread::park_timeout(Duration::from_nanos(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruptor::wait_strategy::BusySpinWaitStrategy;

    fn sequencers(buffer_size: usize) -> Vec<Box<dyn Sequencer>> {
        vec![
            Box::new(
                SingleProducerSequencer::new(buffer_size, Arc::new(BusySpinWaitStrategy)).unwrap(),
            ),
            Box::new(
                MultiProducerSequencer::new(buffer_size, Arc::new(BusySpinWaitStrategy)).unwrap(),
            ),
        ]
    }

    #[test]
    fn test_buffer_size_validation() {
        assert_eq!(
            validate_buffer_size(0),
            Err(ConfigError::BufferSizeNotPowerOfTwo(0))
        );
        assert_eq!(
            validate_buffer_size(12),
            Err(ConfigError::BufferSizeNotPowerOfTwo(12))
        );
        assert_eq!(
            validate_buffer_size(MAX_BUFFER_SIZE * 2),
            Err(ConfigError::BufferSizeTooLarge(MAX_BUFFER_SIZE * 2))
        );
        assert!(validate_buffer_size(1).is_ok());
        assert!(validate_buffer_size(1024).is_ok());
    }

    #[test]
    fn test_claims_strictly_increase() {
        for sequencer in sequencers(16) {
            assert_eq!(sequencer.cursor(), -1);
            // SAFETY: single-threaded test; no ring buffer reads these slots.
            unsafe {
                assert_eq!(sequencer.next(), 0);
                assert_eq!(sequencer.next_n(3), Ok(3));
                assert_eq!(sequencer.try_next(), Ok(4));
                assert_eq!(sequencer.try_next_n(2), Ok(6));
            }
        }
    }

    #[test]
    fn test_invalid_claim_counts() {
        for sequencer in sequencers(8) {
            let invalid = |requested| ClaimError::InvalidCount {
                requested,
                buffer_size: 8,
            };
            // SAFETY: rejected claims take nothing.
            unsafe {
                assert_eq!(sequencer.next_n(0), Err(invalid(0)));
                assert_eq!(sequencer.next_n(9), Err(invalid(9)));
                assert_eq!(sequencer.try_next_n(9), Err(invalid(9)));
            }
        }
    }

    #[test]
    fn test_try_next_fails_when_gated() {
        for sequencer in sequencers(4) {
            let consumer = Arc::new(Sequence::default());
            sequencer.add_gating_sequences(&[Arc::clone(&consumer)]);

            // SAFETY: single-threaded test; no ring buffer reads these slots.
            unsafe {
                let hi = sequencer.try_next_n(4).unwrap();
                sequencer.publish_range(0, hi);
                assert_eq!(sequencer.remaining_capacity(), 0);
                assert!(!sequencer.has_available_capacity(1));
                assert_eq!(sequencer.try_next(), Err(InsufficientCapacity));
                assert_eq!(
                    sequencer.try_next_n(1),
                    Err(ClaimError::InsufficientCapacity(InsufficientCapacity))
                );

                consumer.set(1);
                assert_eq!(sequencer.remaining_capacity(), 2);
                assert!(sequencer.has_available_capacity(2));
                assert!(!sequencer.has_available_capacity(3));
                assert_eq!(sequencer.try_next_n(2), Ok(5));
            }
        }
    }

    #[test]
    fn test_gating_membership() {
        for sequencer in sequencers(8) {
            // SAFETY: single-threaded test; no ring buffer reads these slots.
            unsafe {
                let hi = sequencer.next_n(3).unwrap();
                sequencer.publish_range(0, hi);
            }

            // Joins at the cursor, not at its own stale value.
            let late = Arc::new(Sequence::default());
            sequencer.add_gating_sequences(&[Arc::clone(&late)]);
            assert_eq!(late.get(), sequencer.cursor());
            assert_eq!(sequencer.minimum_sequence(), sequencer.cursor());

            assert!(sequencer.remove_gating_sequence(&late));
            assert!(!sequencer.remove_gating_sequence(&late));
        }
    }

    #[test]
    fn test_producer_type_and_cursor_reader() {
        let kinds: Vec<_> = sequencers(8).iter().map(|s| s.producer_type()).collect();
        assert_eq!(kinds, vec![ProducerType::Single, ProducerType::Multi]);

        for sequencer in sequencers(8) {
            let cursor = sequencer.cursor_sequence();
            // SAFETY: single-threaded test; no ring buffer reads these slots.
            unsafe {
                let hi = sequencer.next_n(2).unwrap();
                sequencer.publish_range(0, hi);
            }
            assert_eq!(cursor.get(), 1);
            assert!(cursor.same_sequence(&sequencer.cursor_sequence()));
        }
    }

    #[test]
    fn test_ungated_sequencer_minimum_is_cursor() {
        for sequencer in sequencers(8) {
            // SAFETY: nothing outstanding and no consumers.
            unsafe {
                sequencer.claim(5);
                sequencer.publish(5);
            }
            assert_eq!(sequencer.minimum_sequence(), sequencer.cursor());
        }
    }
}
