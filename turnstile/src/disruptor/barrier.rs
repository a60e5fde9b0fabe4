//! Consumer-side view of a ring buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{Alert, WaitError};
use super::sequence_group::FixedSequenceGroup;
use super::sequencer::Sequencer;
use super::wait_strategy::WaitStrategy;
use crate::sequence::SequenceReader;

/// Sticky cancellation flag checked by waiting consumers.
#[derive(Debug, Default)]
pub struct AlertFlag {
    raised: AtomicBool,
}

impl AlertFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// # Errors
    ///
    /// [`Alert`] while the flag is raised.
    #[inline]
    pub fn check(&self) -> Result<(), Alert> {
        if self.is_raised() { Err(Alert) } else { Ok(()) }
    }
}

/// Tracks the producer cursor and any upstream consumers a stage depends on.
///
/// A barrier with no dependencies waits on the cursor directly; otherwise it
/// waits on the slowest dependency, which can never be ahead of the cursor.
pub struct SequenceBarrier {
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: SequenceReader,
    dependents: FixedSequenceGroup,
    alert: AlertFlag,
}

impl SequenceBarrier {
    pub fn new(sequencer: Arc<dyn Sequencer>, dependencies: &[SequenceReader]) -> Self {
        let cursor = sequencer.cursor_sequence();
        let dependents = if dependencies.is_empty() {
            FixedSequenceGroup::new(vec![Arc::clone(cursor.inner())])
        } else {
            FixedSequenceGroup::new(
                dependencies
                    .iter()
                    .map(|reader| Arc::clone(reader.inner()))
                    .collect::<Vec<_>>(),
            )
        };
        Self {
            wait_strategy: Arc::clone(sequencer.wait_strategy()),
            sequencer,
            cursor,
            dependents,
            alert: AlertFlag::new(),
        }
    }

    /// Waits until `sequence` is published and returns the highest sequence
    /// that is safe to read, which may be beyond `sequence`.
    ///
    /// A return value below `sequence` means the dependencies have moved but
    /// `sequence` itself is not yet published; callers wait again.
    ///
    /// # Errors
    ///
    /// [`WaitError::Alert`] if the barrier is alerted, [`WaitError::Timeout`]
    /// if the wait strategy gave up.
    pub fn wait_for(&self, sequence: i64) -> Result<i64, WaitError> {
        self.alert.check()?;

        let available =
            self.wait_strategy
                .wait_for(sequence, &self.cursor, &self.dependents, &self.alert)?;
        if available < sequence {
            return Ok(available);
        }
        Ok(self
            .sequencer
            .highest_published_sequence(sequence, available))
    }

    /// Sequencer whose cursor this barrier tracks.
    pub(crate) fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    /// Minimum of the dependencies, or the cursor without any.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.dependents.get()
    }

    #[must_use]
    pub fn is_alerted(&self) -> bool {
        self.alert.is_raised()
    }

    /// Raises the alert and wakes blocked waiters.
    pub fn alert(&self) {
        self.alert.raise();
        self.wait_strategy.signal_all_when_blocking();
    }

    pub fn clear_alert(&self) {
        self.alert.clear();
    }

    /// # Errors
    ///
    /// [`Alert`] while the barrier is alerted.
    pub fn check_alert(&self) -> Result<(), Alert> {
        self.alert.check()
    }
}
