//! Cache-line isolated progress counter.
//!
//! A [`Sequence`] is the unit of coordination of the multicast ring: the
//! producer cursor, every consumer's progress and the gating minimum are all
//! sequences. Each one is written by a single logical owner and read by many
//! threads, so the value lives alone on its own cache line.

use std::fmt;
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering, fence};

/// Value of a sequence before anything has been claimed or consumed.
pub const INITIAL_VALUE: i64 = -1;

const CACHE_LINE: usize = 64;

/// Padded atomic 64-bit sequence counter.
///
/// `set` is a release store and `get` an acquire load: a reader that observes
/// a value also observes everything the writer did before setting it.
#[repr(C, align(64))]
pub struct Sequence {
    _lhs: [u8; CACHE_LINE],
    value: AtomicI64,
    _rhs: [u8; 2 * CACHE_LINE - size_of::<AtomicI64>()],
}

const _: () = assert!(offset_of!(Sequence, value) == CACHE_LINE);
const _: () = assert!(
    size_of::<Sequence>() - offset_of!(Sequence, value) - size_of::<AtomicI64>() >= CACHE_LINE
);

impl Sequence {
    /// Creates a sequence holding `initial`.
    #[must_use]
    pub const fn new(initial: i64) -> Self {
        Self {
            _lhs: [0; CACHE_LINE],
            value: AtomicI64::new(initial),
            _rhs: [0; 2 * CACHE_LINE - size_of::<AtomicI64>()],
        }
    }

    /// Acquire load of the current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Relaxed load, for the owner re-reading its own value.
    #[inline]
    #[must_use]
    pub fn get_relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Release store.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Store followed by a full fence, so later loads cannot be reordered before it.
    #[inline]
    pub fn set_volatile(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Atomically replaces `expected` with `new`. Returns whether the swap happened.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }

    /// Adds `increment` with a CAS retry loop and returns the new value.
    #[inline]
    pub fn add_and_get(&self, increment: i64) -> i64 {
        let mut current = self.get();
        loop {
            let new = current.wrapping_add(increment);
            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_VALUE)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

/// Shared read-only handle to a [`Sequence`] that another component advances.
///
/// Ring cursors and processor progress are handed out this way so that only
/// their owner can move them. Wrapping a caller-owned sequence is fine too;
/// the caller keeps its `Arc` for writing.
#[derive(Clone)]
pub struct SequenceReader(Arc<Sequence>);

impl SequenceReader {
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.get()
    }

    /// Whether both readers observe the same sequence.
    #[must_use]
    pub fn same_sequence(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<Sequence> {
        &self.0
    }
}

impl From<Arc<Sequence>> for SequenceReader {
    fn from(sequence: Arc<Sequence>) -> Self {
        Self(sequence)
    }
}

impl fmt::Debug for SequenceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SequenceReader").field(&self.get()).finish()
    }
}

/// Returns the smallest value in `sequences`, or `default` when the set is empty.
///
/// `default` also caps the result, so a producer passing its own cursor never
/// sees a minimum ahead of itself.
#[must_use]
pub fn minimum_sequence(sequences: &[Arc<Sequence>], default: i64) -> i64 {
    sequences
        .iter()
        .map(|sequence| sequence.get())
        .fold(default, i64::min)
}
