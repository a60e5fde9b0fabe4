//! Bounded lock-free point-to-point queues.
//!
//! Four implementations, one per producer/consumer cardinality:
//!
//! | Module    | Producers | Consumers | Publish signal        |
//! |-----------|-----------|-----------|-----------------------|
//! | [`spsc`]  | one       | one       | slot occupancy flag   |
//! | [`mpsc`]  | many      | one       | slot occupancy flag   |
//! | [`spmc`]  | one       | many      | slot occupancy flag   |
//! | [`mpmc`]  | many      | many      | per-slot turn counter |
//!
//! Every module exposes `channel(capacity)` returning a `(Producer, Consumer)`
//! pair. Capacity is rounded up to a power of two. Single-role handles are
//! [`Send`] but not [`Sync`] or [`Clone`], so the role guarantees the algorithm
//! relies on are enforced by the type system. Multi-role handles are cheap to
//! clone and share.
//!
//! `offer` hands the element back when the queue is full and `poll` returns
//! `None` when it is empty. Neither ever blocks; the `*_blocking` and `*_with`
//! helpers layer spinning and idling on top.
//!
//! # Example
//!
//! ```
//! use turnstile::queue::mpmc;
//!
//! let (tx, rx) = mpmc::channel::<u64>(8).unwrap();
//! tx.offer(42).unwrap();
//! assert_eq!(rx.poll(), Some(42));
//! assert_eq!(rx.poll(), None);
//! ```

pub mod mpmc;
pub mod mpsc;
pub mod spmc;
pub mod spsc;

mod slot;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::slots;

/// Marker type to opt-out of `Sync` while remaining `Send`.
pub(crate) type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Upper bound on the look-ahead distance of SPSC and MPMC batching.
pub(crate) const MAX_LOOK_AHEAD_STEP: usize = 4096;

/// Elements moved per round by the `drain_with` / `fill_with` loops.
pub(crate) const ROUND_LIMIT: usize = 4096;

/// Error constructing a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A capacity of zero was requested.
    #[error("queue capacity must be greater than 0")]
    ZeroCapacity,
    /// The capacity cannot be rounded up to a power of two.
    #[error("queue capacity {0} is too large to round up to a power of two")]
    CapacityOverflow(usize),
}

pub(crate) fn queue_capacity(requested: usize, minimum: usize) -> Result<usize, QueueError> {
    if requested == 0 {
        return Err(QueueError::ZeroCapacity);
    }
    slots::round_capacity(requested, minimum).ok_or(QueueError::CapacityOverflow(requested))
}

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Infinite => Self(None),
            Timeout::Duration(d) => Self(Some(Instant::now() + d)),
        }
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|deadline| Instant::now() > deadline)
    }
}

/// Spins on `offer` until it accepts the item or the timeout elapses.
pub(crate) fn offer_until<T>(
    mut item: T,
    timeout: Timeout,
    mut offer: impl FnMut(T) -> Result<(), T>,
) -> Result<(), T> {
    let deadline = Deadline::after(timeout);
    loop {
        match offer(item) {
            Ok(()) => return Ok(()),
            Err(returned) => {
                item = returned;
                if deadline.expired() {
                    return Err(item);
                }
                std::hint::spin_loop();
            }
        }
    }
}

/// Spins on `poll` until it yields an item or the timeout elapses.
pub(crate) fn poll_until<T>(timeout: Timeout, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Deadline::after(timeout);
    loop {
        if let Some(item) = poll() {
            return Some(item);
        }
        if deadline.expired() {
            return None;
        }
        std::hint::spin_loop();
    }
}

/// Back-off policy for the `drain_with` / `fill_with` loops.
///
/// Called after a round that moved nothing, with the number of consecutive
/// idle rounds so far. Returns the counter to pass on the next idle round.
pub trait IdleStrategy {
    fn idle(&mut self, idle_count: u32) -> u32;
}

impl<F: FnMut(u32) -> u32> IdleStrategy for F {
    fn idle(&mut self, idle_count: u32) -> u32 {
        self(idle_count)
    }
}

/// Spins with a CPU hint on every idle round.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinIdle;

impl IdleStrategy for SpinIdle {
    fn idle(&mut self, idle_count: u32) -> u32 {
        std::hint::spin_loop();
        idle_count.saturating_add(1)
    }
}

/// Spins for the first `spins` idle rounds, then yields the thread.
#[derive(Debug, Clone, Copy)]
pub struct YieldIdle {
    pub spins: u32,
}

impl Default for YieldIdle {
    fn default() -> Self {
        Self { spins: 100 }
    }
}

impl IdleStrategy for YieldIdle {
    fn idle(&mut self, idle_count: u32) -> u32 {
        if idle_count < self.spins {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        idle_count.saturating_add(1)
    }
}

/// Loop condition for the `drain_with` / `fill_with` loops.
pub trait ExitCondition {
    /// Returns `false` to stop the loop.
    fn keep_running(&self) -> bool;
}

impl<F: Fn() -> bool> ExitCondition for F {
    fn keep_running(&self) -> bool {
        self()
    }
}

/// Runs `round(ROUND_LIMIT)` until `exit` says stop, idling after empty rounds.
///
/// Returns the total number of elements moved.
pub(crate) fn run_rounds(
    mut round: impl FnMut(usize) -> usize,
    mut idle: impl IdleStrategy,
    exit: impl ExitCondition,
) -> usize {
    let mut total = 0usize;
    let mut idle_count = 0u32;
    while exit.keep_running() {
        let moved = round(ROUND_LIMIT);
        if moved == 0 {
            idle_count = idle.idle(idle_count);
        } else {
            idle_count = 0;
            total = total.wrapping_add(moved);
        }
    }
    total
}

/// Best-effort element count from a producer and a consumer index.
///
/// Reads consumer, producer, consumer and retries until both consumer reads
/// agree, so the pair is consistent. The result is clamped to `0..=capacity`.
pub(crate) fn current_len(
    producer: &AtomicUsize,
    consumer: &AtomicUsize,
    capacity: usize,
) -> usize {
    let mut after = consumer.load(Ordering::Acquire);
    loop {
        let before = after;
        let produced = producer.load(Ordering::Acquire);
        after = consumer.load(Ordering::Acquire);
        if before == after {
            let size = produced.wrapping_sub(after) as isize;
            return size.clamp(0, capacity as isize) as usize;
        }
    }
}

/// Look-ahead distance for a queue of `capacity` slots.
pub(crate) fn look_ahead_step(capacity: usize, minimum: usize) -> usize {
    (capacity / 4).min(MAX_LOOK_AHEAD_STEP).max(minimum)
}
