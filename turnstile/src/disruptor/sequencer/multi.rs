//! Sequencer for rings fed by many producing threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{Sequencer, SequencerCore, park_briefly};
use crate::disruptor::config::ProducerType;
use crate::disruptor::error::{ClaimError, ConfigError, InsufficientCapacity};
use crate::disruptor::wait_strategy::WaitStrategy;
use crate::sequence::{Sequence, SequenceReader};
use crate::slots::SlotArray;

/// Sequencer for a ring shared by any number of producing threads.
///
/// Producers race on a CAS of the cursor, which therefore tracks the highest
/// *claimed* sequence. Publication is recorded per slot as the lap number of
/// the sequence written there: slot `s & mask` holds `s >> shift` once `s`
/// is published. Consumers use
/// [`highest_published_sequence`](Sequencer::highest_published_sequence) to
/// find the contiguous published prefix.
pub struct MultiProducerSequencer {
    core: SequencerCore,
    gating_cache: Sequence,
    available: SlotArray<AtomicI32>,
}

impl MultiProducerSequencer {
    /// # Errors
    ///
    /// [`ConfigError`] unless `buffer_size` is a supported power of two.
    pub fn new(
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        let core = SequencerCore::new(buffer_size, wait_strategy)?;
        Ok(Self {
            core,
            gating_cache: Sequence::default(),
            available: SlotArray::new(buffer_size, |_| AtomicI32::new(-1)),
        })
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.available.shift()) as i32
    }

    #[inline]
    fn set_available(&self, sequence: i64) {
        self.available
            .slot(sequence)
            .store(self.availability_flag(sequence), Ordering::Release);
    }

    fn has_capacity(&self, required: i64, cursor_value: i64) -> bool {
        let wrap_point = cursor_value + required - self.core.size();
        let cached = self.gating_cache.get();

        if wrap_point > cached || cached > cursor_value {
            let min = self.core.gating.minimum(cursor_value);
            self.gating_cache.set(min);
            if wrap_point > min {
                return false;
            }
        }
        true
    }

    fn claim_next(&self, n: i64) -> i64 {
        loop {
            let current = self.core.cursor.get();
            let next = current + n;
            let wrap_point = next - self.core.size();
            let cached = self.gating_cache.get();

            if wrap_point > cached || cached > current {
                let gating = self.core.gating.minimum(current);
                if wrap_point > gating {
                    park_briefly();
                    continue;
                }
                self.gating_cache.set(gating);
            } else if self.core.cursor.compare_and_set(current, next) {
                return next;
            }
        }
    }
}

// SAFETY: claims are unique CAS ranges that never pass the gating minimum,
// and availability is the per-lap flag written on publish.
unsafe impl Sequencer for MultiProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.core.buffer_size
    }

    fn cursor_sequence(&self) -> SequenceReader {
        SequenceReader::from(Arc::clone(&self.core.cursor))
    }

    fn cursor(&self) -> i64 {
        self.core.cursor.get()
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.core.wait_strategy
    }

    fn producer_type(&self) -> ProducerType {
        ProducerType::Multi
    }

    unsafe fn next(&self) -> i64 {
        self.claim_next(1)
    }

    unsafe fn next_n(&self, n: usize) -> Result<i64, ClaimError> {
        let n = self.core.claim_count(n)?;
        Ok(self.claim_next(n))
    }

    unsafe fn try_next_n(&self, n: usize) -> Result<i64, ClaimError> {
        let n = self.core.claim_count(n)?;
        loop {
            let current = self.core.cursor.get();
            if !self.has_capacity(n, current) {
                return Err(InsufficientCapacity.into());
            }
            let next = current + n;
            if self.core.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    unsafe fn claim(&self, sequence: i64) {
        self.core.cursor.set(sequence);
    }

    unsafe fn publish(&self, sequence: i64) {
        self.set_available(sequence);
        self.core.signal();
    }

    unsafe fn publish_range(&self, lo: i64, hi: i64) {
        for sequence in lo..=hi {
            self.set_available(sequence);
        }
        self.core.signal();
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.available.slot(sequence).load(Ordering::Acquire) == self.availability_flag(sequence)
    }

    fn highest_published_sequence(&self, lo: i64, available: i64) -> i64 {
        (lo..=available)
            .find(|&sequence| !self.is_available(sequence))
            .map_or(available, |gap| gap - 1)
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.core
            .gating
            .add_while_running(&self.core.cursor, sequences);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.core.gating.remove(sequence)
    }

    fn minimum_sequence(&self) -> i64 {
        self.core.gating.minimum(self.core.cursor.get())
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.core.cursor.get();
        let consumed = self.core.gating.minimum(produced);
        self.core.size() - (produced - consumed)
    }

    fn has_available_capacity(&self, required: usize) -> bool {
        self.has_capacity(required as i64, self.core.cursor.get())
    }
}
