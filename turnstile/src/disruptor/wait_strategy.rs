//! Consumer wait policies.
//!
//! A wait strategy blocks a consumer until the sequence it wants is covered by
//! its dependencies, checking the barrier's alert flag as it goes. Strategies
//! trade latency for CPU:
//!
//! | Name               | Waits by                     | Wakes on signal |
//! |--------------------|------------------------------|-----------------|
//! | `busy-spin`        | spinning                     | n/a             |
//! | `yielding`         | spinning, then `yield_now`   | n/a             |
//! | `blocking`         | condition variable           | yes             |
//! | `timeout-blocking` | condition variable, deadline | yes             |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::barrier::AlertFlag;
use super::error::{ConfigError, WaitError};
use super::sequence_group::FixedSequenceGroup;
use crate::sequence::SequenceReader;

/// Policy a consumer uses to wait for a sequence.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Waits until `dependents` reach `sequence` and returns their minimum,
    /// which may be beyond `sequence`.
    ///
    /// `cursor` is the producer cursor; blocking strategies sleep on it so
    /// that [`signal_all_when_blocking`](Self::signal_all_when_blocking) wakes
    /// them.
    ///
    /// # Errors
    ///
    /// [`WaitError::Alert`] once `alert` is raised, [`WaitError::Timeout`] if
    /// the strategy has a deadline and it elapsed.
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &SequenceReader,
        dependents: &FixedSequenceGroup,
        alert: &AlertFlag,
    ) -> Result<i64, WaitError>;

    /// Wakes consumers blocked in `wait_for`. Publishers call this after every publish.
    fn signal_all_when_blocking(&self);
}

/// Spins with a CPU hint until the sequence is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &SequenceReader,
        dependents: &FixedSequenceGroup,
        alert: &AlertFlag,
    ) -> Result<i64, WaitError> {
        loop {
            let available = dependents.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {}
}

/// Spins for a while, then yields the thread between checks.
#[derive(Debug, Clone, Copy)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub const DEFAULT_SPIN_TRIES: u32 = 100;

    #[must_use]
    pub const fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SPIN_TRIES)
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &SequenceReader,
        dependents: &FixedSequenceGroup,
        alert: &AlertFlag,
    ) -> Result<i64, WaitError> {
        let mut counter = self.spin_tries;
        loop {
            let available = dependents.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;
            if counter == 0 {
                thread::yield_now();
            } else {
                counter -= 1;
                std::hint::spin_loop();
            }
        }
    }

    fn signal_all_when_blocking(&self) {}
}

/// Sleeps on a condition variable until the cursor passes the sequence.
///
/// Once the cursor is there, any lag of upstream consumers is spun out.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWaitStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &SequenceReader,
        dependents: &FixedSequenceGroup,
        alert: &AlertFlag,
    ) -> Result<i64, WaitError> {
        if cursor.get() < sequence {
            let mut guard = self.mutex.lock();
            while cursor.get() < sequence {
                alert.check()?;
                self.condvar.wait(&mut guard);
            }
        }
        spin_on_dependents(sequence, dependents, alert)
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// [`BlockingWaitStrategy`] that gives up with [`WaitError::Timeout`].
#[derive(Debug)]
pub struct TimeoutBlockingWaitStrategy {
    timeout: Duration,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl TimeoutBlockingWaitStrategy {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl WaitStrategy for TimeoutBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &SequenceReader,
        dependents: &FixedSequenceGroup,
        alert: &AlertFlag,
    ) -> Result<i64, WaitError> {
        let start = Instant::now();
        if cursor.get() < sequence {
            let mut guard = self.mutex.lock();
            while cursor.get() < sequence {
                alert.check()?;
                let remaining = self.timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Err(WaitError::Timeout);
                }
                self.condvar.wait_for(&mut guard, remaining);
            }
        }
        spin_on_dependents(sequence, dependents, alert)
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

fn spin_on_dependents(
    sequence: i64,
    dependents: &FixedSequenceGroup,
    alert: &AlertFlag,
) -> Result<i64, WaitError> {
    loop {
        let available = dependents.get();
        if available >= sequence {
            return Ok(available);
        }
        alert.check()?;
        std::hint::spin_loop();
    }
}

/// Wait strategy selection, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategyKind {
    BusySpin,
    Yielding,
    #[default]
    Blocking,
    TimeoutBlocking,
}

impl WaitStrategyKind {
    pub const ALL: [Self; 4] = [
        Self::BusySpin,
        Self::Yielding,
        Self::Blocking,
        Self::TimeoutBlocking,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BusySpin => "busy-spin",
            Self::Yielding => "yielding",
            Self::Blocking => "blocking",
            Self::TimeoutBlocking => "timeout-blocking",
        }
    }

    /// Instantiates the strategy. `timeout` is only used by `timeout-blocking`.
    #[must_use]
    pub fn build(self, timeout: Duration) -> Arc<dyn WaitStrategy> {
        match self {
            Self::BusySpin => Arc::new(BusySpinWaitStrategy),
            Self::Yielding => Arc::new(YieldingWaitStrategy::default()),
            Self::Blocking => Arc::new(BlockingWaitStrategy::new()),
            Self::TimeoutBlocking => Arc::new(TimeoutBlockingWaitStrategy::new(timeout)),
        }
    }
}

impl fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitStrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownWaitStrategy(s.to_owned()))
    }
}
