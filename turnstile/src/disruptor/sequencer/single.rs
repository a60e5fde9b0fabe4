//! Sequencer for rings fed by one producing thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{Sequencer, SequencerCore, park_briefly};
use crate::disruptor::config::ProducerType;
use crate::disruptor::error::{ClaimError, ConfigError, InsufficientCapacity};
use crate::disruptor::wait_strategy::WaitStrategy;
use crate::sequence::{INITIAL_VALUE, Sequence, SequenceReader};

/// Claim state private to the producing thread.
///
/// Only the producer touches these, so relaxed atomics are enough; they are
/// atomics rather than cells only so the sequencer can be shared.
#[repr(align(64))]
struct ClaimState {
    next_value: AtomicI64,
    cached_gating: AtomicI64,
}

/// Sequencer for a ring with exactly one producing thread.
///
/// Claims are plain counter bumps. The cursor is only moved on publish, so it
/// is always the highest published sequence. The unsafe claim methods rely
/// on their caller for single production; claiming from two threads at once
/// hands out the same sequences twice.
pub struct SingleProducerSequencer {
    core: SequencerCore,
    state: ClaimState,
}

impl SingleProducerSequencer {
    /// # Errors
    ///
    /// [`ConfigError`] unless `buffer_size` is a supported power of two.
    pub fn new(
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            core: SequencerCore::new(buffer_size, wait_strategy)?,
            state: ClaimState {
                next_value: AtomicI64::new(INITIAL_VALUE),
                cached_gating: AtomicI64::new(INITIAL_VALUE),
            },
        })
    }

    fn has_capacity(&self, required: i64, publish_cursor: bool) -> bool {
        let next_value = self.state.next_value.load(Ordering::Relaxed);
        let wrap_point = next_value + required - self.core.size();
        let cached = self.state.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            if publish_cursor {
                self.core.cursor.set_volatile(next_value);
            }
            let min = self.core.gating.minimum(next_value);
            self.state.cached_gating.store(min, Ordering::Relaxed);
            if wrap_point > min {
                return false;
            }
        }
        true
    }

    fn claim_next(&self, n: i64) -> i64 {
        let next_value = self.state.next_value.load(Ordering::Relaxed);
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.core.size();
        let cached = self.state.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            // Everything up to next_value is published by contract.
            self.core.cursor.set_volatile(next_value);
            let mut min = self.core.gating.minimum(next_value);
            while wrap_point > min {
                park_briefly();
                min = self.core.gating.minimum(next_value);
            }
            self.state.cached_gating.store(min, Ordering::Relaxed);
        }

        self.state.next_value.store(next_sequence, Ordering::Relaxed);
        next_sequence
    }
}

// SAFETY: claims never pass the gating minimum, and availability is read off
// the cursor, which only moves to sequences the caller has published.
unsafe impl Sequencer for SingleProducerSequencer {
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
        ProducerType::Single
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
        if !self.has_capacity(n, true) {
            return Err(InsufficientCapacity.into());
        }
        let next_sequence = self.state.next_value.load(Ordering::Relaxed) + n;
        self.state.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    unsafe fn claim(&self, sequence: i64) {
        self.state.next_value.store(sequence, Ordering::Relaxed);
    }

    unsafe fn publish(&self, sequence: i64) {
        self.core.cursor.set(sequence);
        self.core.signal();
    }

    unsafe fn publish_range(&self, _lo: i64, hi: i64) {
        // SAFETY: forwarded publish contract.
        unsafe { self.publish(hi) };
    }

    fn is_available(&self, sequence: i64) -> bool {
        let current = self.core.cursor.get();
        sequence <= current && sequence > current - self.core.size()
    }

    fn highest_published_sequence(&self, _lo: i64, available: i64) -> i64 {
        // Dependency sequences may be ahead of the cursor.
        available.min(self.core.cursor.get())
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
        let produced = self.state.next_value.load(Ordering::Relaxed);
        let consumed = self.core.gating.minimum(produced);
        self.core.size() - (produced - consumed)
    }

    fn has_available_capacity(&self, required: usize) -> bool {
        self.has_capacity(required as i64, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruptor::wait_strategy::BusySpinWaitStrategy;
    use std::thread;
    use std::time::Duration;

    fn sequencer(buffer_size: usize) -> SingleProducerSequencer {
        SingleProducerSequencer::new(buffer_size, Arc::new(BusySpinWaitStrategy)).unwrap()
    }

    #[test]
    fn test_cursor_moves_on_publish_only() {
        let sequencer = sequencer(8);
        // SAFETY: single-threaded test.
        let hi = unsafe { sequencer.next_n(4) }.unwrap();
        assert_eq!(hi, 3);
        assert_eq!(sequencer.cursor(), -1);
        assert!(!sequencer.is_available(0));

        // SAFETY: 0..=3 were claimed above.
        unsafe { sequencer.publish_range(0, hi) };
        assert_eq!(sequencer.cursor(), 3);
        assert!(sequencer.is_available(0));
        assert!(sequencer.is_available(3));
        assert!(!sequencer.is_available(4));
        assert_eq!(sequencer.highest_published_sequence(0, 3), 3);
    }

    #[test]
    fn test_claim_waits_for_gating_consumer() {
        let sequencer = Arc::new(sequencer(4));
        let consumer = Arc::new(Sequence::default());
        sequencer.add_gating_sequences(&[Arc::clone(&consumer)]);

        for _ in 0..4 {
            // SAFETY: one producing thread, each claim published in turn.
            unsafe {
                let sequence = sequencer.next();
                sequencer.publish(sequence);
            }
        }

        let producer = {
            let sequencer = Arc::clone(&sequencer);
            // SAFETY: the spawned thread is the only claimant from here on.
            thread::spawn(move || unsafe { sequencer.next() })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        consumer.set(0);
        assert_eq!(producer.join().unwrap(), 4);
    }

    #[test]
    fn test_published_slots_age_out() {
        let sequencer = sequencer(4);
        // SAFETY: nothing outstanding and no consumers.
        unsafe {
            sequencer.claim(9);
            sequencer.publish(9);
        }
        assert!(sequencer.is_available(6));
        assert!(!sequencer.is_available(5));
    }

    #[test]
    fn test_highest_published_never_passes_cursor() {
        let sequencer = sequencer(8);
        // SAFETY: single-threaded test.
        unsafe {
            let hi = sequencer.next_n(2).unwrap();
            sequencer.publish_range(0, hi);
        }
        // A dependency reporting 6 does not make 2..=6 readable.
        assert_eq!(sequencer.highest_published_sequence(0, 6), 1);
        assert_eq!(sequencer.highest_published_sequence(0, 1), 1);
    }
}
