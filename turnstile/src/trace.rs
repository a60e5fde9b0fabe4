//! Structured logging for the disruptor engine.
//!
//! Built on `tracing` behind the `tracing` feature; without it the macros
//! below expand to nothing. The queues never log. What does:
//!
//! * `debug`: processor start, stop, early exit and release from gating,
//!   gating sequences joining or leaving a ring, executor threads spawning.
//! * `warn`: a barrier alert the running processor did not raise.
//! * `error`: handler faults reported by [`LoggingExceptionHandler`] and
//!   processors the executor could not run.
//!
//! [`LoggingExceptionHandler`]: crate::disruptor::LoggingExceptionHandler

/// Prints turnstile events to stderr, filtered by `RUST_LOG`.
///
/// Without `RUST_LOG` every turnstile event down to `debug` is shown. Safe to
/// call from several test binaries; only the first call installs anything.
/// A no-op unless the `tracing` feature is enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnstile=debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
