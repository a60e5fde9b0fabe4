//! Slot and role-cell types shared by the queue implementations.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Role marker: fields owned exclusively by the single producer.
pub(crate) struct ProducerRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// The role doesn't affect runtime behavior. It makes producer-owned caches a
/// distinct type so they can't be confused with shared slot storage.
#[repr(transparent)]
pub(crate) struct RoleCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T: Copy, Role> RoleCell<T, Role> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    /// # Safety
    ///
    /// Caller must be the sole owner of the role this cell belongs to.
    #[inline]
    pub(crate) unsafe fn load(&self) -> T {
        unsafe { *self.0.get() }
    }

    /// # Safety
    ///
    /// Caller must be the sole owner of the role this cell belongs to.
    #[inline]
    pub(crate) unsafe fn store(&self, value: T) {
        unsafe { *self.0.get() = value }
    }
}

// SAFETY: a RoleCell is only touched by the thread holding its role's handle,
// and that handle is Send but not Sync.
unsafe impl<T: Send, Role> Sync for RoleCell<T, Role> {}

/// Cache cell owned exclusively by the producer.
pub(crate) type ProducerCache<T> = RoleCell<T, ProducerRole>;

/// What a [`FlagSlot`] currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Empty,
    Full,
    /// Claimed by a producer whose supplier panicked. Holds no value; the
    /// consumer steps over it.
    Skipped,
}

const EMPTY: u8 = 0;
const FULL: u8 = 1;
const SKIPPED: u8 = 2;

/// Slot whose occupancy state is the publish signal.
///
/// A producer writes the value and then release-stores `FULL`. A consumer
/// acquire-loads the state, reads the value and then release-stores `EMPTY`.
/// The value is initialized exactly when the state is `FULL`.
pub(crate) struct FlagSlot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> FlagSlot<T> {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            EMPTY => SlotState::Empty,
            FULL => SlotState::Full,
            _ => SlotState::Skipped,
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Writes `item` and publishes it.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive write ownership of this slot and the slot must be empty.
    #[inline]
    pub(crate) unsafe fn put(&self, item: T) {
        unsafe { (*self.value.get()).write(item) };
        self.state.store(FULL, Ordering::Release);
    }

    /// Publishes the slot as a hole without writing a value.
    ///
    /// # Safety
    ///
    /// Same as [`put`](Self::put).
    #[inline]
    pub(crate) unsafe fn skip(&self) {
        self.state.store(SKIPPED, Ordering::Release);
    }

    /// Returns a skipped slot to the producers.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive read ownership of this slot and must have
    /// observed [`SlotState::Skipped`].
    #[inline]
    pub(crate) unsafe fn release_skipped(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }

    /// Moves the value out and marks the slot empty.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive read ownership of this slot and must have
    /// observed `is_full()` (or an index that implies it).
    #[inline]
    pub(crate) unsafe fn take(&self) -> T {
        let item = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(EMPTY, Ordering::Release);
        item
    }

    /// # Safety
    ///
    /// Slot must be full and nobody may take it while the reference lives.
    #[inline]
    pub(crate) unsafe fn get(&self) -> &T {
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Optimistic copy of the value for seqlock-style validation.
    ///
    /// The copy may be torn if a writer races with it. Callers must validate
    /// before calling `assume_init`.
    ///
    /// A volatile read racing a plain write is still a data race under the
    /// Rust memory model. This is the usual seqlock compromise: the bytes are
    /// kept as `MaybeUninit` and discarded unless validation shows no writer
    /// touched the slot, and `T: Copy` rules out drop glue running on a torn
    /// value.
    #[inline]
    pub(crate) fn read_racy(&self) -> MaybeUninit<T>
    where
        T: Copy,
    {
        // SAFETY: reading MaybeUninit<T> bytes is always allowed; the value is only
        // interpreted after the caller's validation succeeds.
        unsafe { ptr::read_volatile(self.value.get()) }
    }
}

impl<T> Drop for FlagSlot<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FULL {
            // SAFETY: `FULL` means the value is initialized, and &mut self is exclusive.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// SAFETY: access to `value` is handed between threads by the state protocol.
unsafe impl<T: Send> Sync for FlagSlot<T> {}
unsafe impl<T: Send> Send for FlagSlot<T> {}

/// Slot with a per-slot turn counter, as in Vyukov's bounded queue.
///
/// - Initial: slot offset (0, 1, ..., C-1)
/// - After producer write: index + 1 (ready for the consumer of `index`)
/// - After consumer read: index + C (free for the producer one lap later)
#[repr(C)]
#[repr(align(64))] // Each slot on its own cache line to avoid false sharing between roles
pub(crate) struct TurnSlot<T> {
    pub(crate) turn: AtomicUsize,
    /// Set instead of writing a value when the producer's supplier panicked.
    /// Published and observed through `turn`.
    skipped: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> TurnSlot<T> {
    pub(crate) const fn new(turn: usize) -> Self {
        Self {
            turn: AtomicUsize::new(turn),
            skipped: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// Caller must have won the producer claim for this slot's current turn.
    #[inline]
    pub(crate) unsafe fn write(&self, item: T) {
        unsafe { (*self.value.get()).write(item) };
    }

    /// # Safety
    ///
    /// Caller must have won the consumer claim for this slot's current turn.
    #[inline]
    pub(crate) unsafe fn read(&self) -> T {
        unsafe { (*self.value.get()).assume_init_read() }
    }

    /// Marks the slot as a hole. The caller then publishes it by advancing `turn`.
    ///
    /// # Safety
    ///
    /// Same as [`write`](Self::write).
    #[inline]
    pub(crate) unsafe fn mark_skipped(&self) {
        self.skipped.store(true, Ordering::Relaxed);
    }

    /// Whether the published turn carries a hole rather than a value.
    #[inline]
    pub(crate) fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Clears the hole marker before the slot is freed for the next lap.
    ///
    /// # Safety
    ///
    /// Caller must have won the consumer claim for this slot's current turn.
    #[inline]
    pub(crate) unsafe fn clear_skipped(&self) {
        self.skipped.store(false, Ordering::Relaxed);
    }

    /// Optimistic copy, validated by re-reading `turn`.
    ///
    /// Carries the same data-race caveat as [`FlagSlot::read_racy`].
    #[inline]
    pub(crate) fn read_racy(&self) -> MaybeUninit<T>
    where
        T: Copy,
    {
        // SAFETY: see FlagSlot::read_racy.
        unsafe { ptr::read_volatile(self.value.get()) }
    }
}

// SAFETY: access to `value` is handed between threads by the turn protocol.
unsafe impl<T: Send> Sync for TurnSlot<T> {}
unsafe impl<T: Send> Send for TurnSlot<T> {}
