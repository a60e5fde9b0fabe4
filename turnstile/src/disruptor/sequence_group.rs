//! Groups of sequences that read as their minimum.
//!
//! [`SequenceGroup`] is the copy-on-write set used for gating: readers load an
//! immutable snapshot while writers swap in a new one. Membership is by
//! identity, so two distinct sequences holding the same value are different
//! members. [`FixedSequenceGroup`] is the frozen variant a barrier uses for
//! its upstream dependencies.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::sequence::{Sequence, minimum_sequence};
use crate::trace::debug;

/// Dynamic set of sequences.
pub struct SequenceGroup {
    sequences: ArcSwap<Vec<Arc<Sequence>>>,
}

impl SequenceGroup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequences: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Minimum of the members, or `default` (also the upper bound) when empty.
    #[inline]
    #[must_use]
    pub fn minimum(&self, default: i64) -> i64 {
        minimum_sequence(&self.sequences.load(), default)
    }

    /// Minimum of the members, or `i64::MAX` when empty.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.minimum(i64::MAX)
    }

    /// Sets every member to `value`.
    pub fn set(&self, value: i64) {
        for sequence in self.sequences.load().iter() {
            sequence.set(value);
        }
    }

    /// Appends `sequence` without touching its value.
    pub fn add(&self, sequence: Arc<Sequence>) {
        self.sequences.rcu(|current| {
            let mut updated = Vec::with_capacity(current.len() + 1);
            updated.extend(current.iter().cloned());
            updated.push(Arc::clone(&sequence));
            updated
        });
    }

    /// Appends `added` while producers are running.
    ///
    /// Each new member is moved to the cursor's value before it becomes
    /// visible and once more after, so it can't gate on slots published before
    /// it joined.
    pub fn add_while_running(&self, cursor: &Sequence, added: &[Arc<Sequence>]) {
        if added.is_empty() {
            return;
        }
        self.sequences.rcu(|current| {
            let cursor_value = cursor.get();
            let mut updated = Vec::with_capacity(current.len() + added.len());
            updated.extend(current.iter().cloned());
            for sequence in added {
                sequence.set(cursor_value);
                updated.push(Arc::clone(sequence));
            }
            updated
        });
        let cursor_value = cursor.get();
        for sequence in added {
            sequence.set(cursor_value);
        }
        debug!(added = added.len(), cursor = cursor_value, "gating sequences added");
    }

    /// Removes every member that is `sequence` itself. Returns whether any was removed.
    pub fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut removed = false;
        self.sequences.rcu(|current| {
            let kept: Vec<_> = current
                .iter()
                .filter(|member| !Arc::ptr_eq(member, sequence))
                .cloned()
                .collect();
            removed = kept.len() != current.len();
            kept
        });
        if removed {
            debug!("gating sequence removed");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current snapshot of the members.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Sequence>>> {
        self.sequences.load_full()
    }
}

impl Default for SequenceGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable set of sequences; reads as their minimum.
#[derive(Debug, Clone)]
pub struct FixedSequenceGroup {
    sequences: Box<[Arc<Sequence>]>,
}

impl FixedSequenceGroup {
    #[must_use]
    pub fn new(sequences: impl Into<Box<[Arc<Sequence>]>>) -> Self {
        Self {
            sequences: sequences.into(),
        }
    }

    /// Minimum of the members, or `i64::MAX` when empty.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        minimum_sequence(&self.sequences, i64::MAX)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_reads_minimum() {
        let group = SequenceGroup::new();
        assert_eq!(group.get(), i64::MAX);
        assert_eq!(group.minimum(5), 5);

        let a = Arc::new(Sequence::new(7));
        let b = Arc::new(Sequence::new(3));
        group.add(Arc::clone(&a));
        group.add(Arc::clone(&b));
        assert_eq!(group.len(), 2);
        assert_eq!(group.get(), 3);

        group.set(11);
        assert_eq!(a.get(), 11);
        assert_eq!(b.get(), 11);
    }

    #[test]
    fn test_remove_by_identity() {
        let group = SequenceGroup::new();
        let a = Arc::new(Sequence::new(4));
        let twin = Arc::new(Sequence::new(4));
        group.add(Arc::clone(&a));
        group.add(Arc::clone(&twin));
        group.add(Arc::clone(&a));

        assert!(group.remove(&a));
        assert_eq!(group.len(), 1);
        assert!(Arc::ptr_eq(&group.snapshot()[0], &twin));
        assert!(!group.remove(&a));
    }

    #[test]
    fn test_add_while_running_moves_to_cursor() {
        let group = SequenceGroup::new();
        let cursor = Sequence::new(41);
        let late = Arc::new(Sequence::default());

        group.add_while_running(&cursor, &[Arc::clone(&late)]);
        assert_eq!(late.get(), 41);
        assert_eq!(group.get(), 41);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let group = SequenceGroup::new();
        group.add(Arc::new(Sequence::new(1)));
        let before = group.snapshot();
        group.add(Arc::new(Sequence::new(2)));
        assert_eq!(before.len(), 1);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_fixed_group() {
        let fixed = FixedSequenceGroup::new(vec![
            Arc::new(Sequence::new(9)),
            Arc::new(Sequence::new(2)),
        ]);
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed.get(), 2);
        assert_eq!(
            FixedSequenceGroup::new(Vec::<Arc<Sequence>>::new()).get(),
            i64::MAX
        );
    }
}
