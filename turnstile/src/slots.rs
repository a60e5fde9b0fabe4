//! Power-of-two circular slot storage shared by the queues and the ring buffer.
//!
//! Indices are free-running counters. A slot is addressed by masking the
//! counter with `capacity - 1`; the lap a counter is on is `index >> shift`.

/// Converts a free-running counter into a slot offset.
pub trait SlotIndex: Copy {
    fn slot_offset(self, mask: usize) -> usize;
}

impl SlotIndex for usize {
    #[inline]
    fn slot_offset(self, mask: usize) -> usize {
        self & mask
    }
}

impl SlotIndex for i64 {
    #[inline]
    fn slot_offset(self, mask: usize) -> usize {
        // Sequences are non-negative once claimed, so the cast never loses lap bits we need.
        (self as usize) & mask
    }
}

/// Fixed-capacity array of slots addressed by counter.
pub struct SlotArray<S> {
    slots: Box<[S]>,
    mask: usize,
    shift: u32,
}

impl<S> SlotArray<S> {
    /// Builds `capacity` slots, calling `init` with each slot's offset.
    ///
    /// `capacity` must already be a power of two; callers validate or round it first.
    pub(crate) fn new(capacity: usize, init: impl FnMut(usize) -> S) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity).map(init).collect(),
            mask: capacity - 1,
            shift: capacity.trailing_zeros(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) const fn mask(&self) -> usize {
        self.mask
    }

    /// log2 of the capacity.
    #[inline]
    pub(crate) const fn shift(&self) -> u32 {
        self.shift
    }

    #[inline]
    pub(crate) fn slot<I: SlotIndex>(&self, index: I) -> &S {
        // SAFETY: slot_offset masks with capacity - 1, so the offset is always in bounds.
        unsafe { self.slots.get_unchecked(index.slot_offset(self.mask)) }
    }
}

/// Rounds a requested capacity up to a power of two no smaller than `minimum`.
///
/// Returns `None` for zero or when the rounded value overflows `usize`.
pub(crate) fn round_capacity(requested: usize, minimum: usize) -> Option<usize> {
    if requested == 0 {
        return None;
    }
    requested.max(minimum).checked_next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_wraps_counters() {
        let slots = SlotArray::new(8, |offset| offset);
        assert_eq!(slots.capacity(), 8);
        assert_eq!(slots.mask(), 7);
        assert_eq!(slots.shift(), 3);
        assert_eq!(*slots.slot(3usize), 3);
        assert_eq!(*slots.slot(11usize), 3);
        assert_eq!(*slots.slot(16i64), 0);
    }

    #[test]
    fn test_round_capacity() {
        assert_eq!(round_capacity(0, 4), None);
        assert_eq!(round_capacity(1, 4), Some(4));
        assert_eq!(round_capacity(5, 1), Some(8));
        assert_eq!(round_capacity(1024, 2), Some(1024));
        assert_eq!(round_capacity(usize::MAX, 1), None);
    }
}
