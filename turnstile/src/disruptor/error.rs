//! Error types of the multicast ring.
//!
//! [`Alert`] and [`InsufficientCapacity`] are signalled on hot paths, so they
//! are zero-sized `Copy` values. Creating one never allocates or captures a
//! backtrace.

use std::any::Any;

use thiserror::Error;

/// The barrier was alerted; the waiting consumer should check whether it is halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence barrier alerted")]
pub struct Alert;

/// A non-blocking claim found fewer free slots than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient capacity in ring buffer")]
pub struct InsufficientCapacity;

/// Why a barrier wait returned without reaching the requested sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error(transparent)]
    Alert(#[from] Alert),
    /// The wait strategy's deadline elapsed.
    #[error("timed out waiting for sequence")]
    Timeout,
}

/// Error claiming sequences from a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error(transparent)]
    InsufficientCapacity(#[from] InsufficientCapacity),
    /// `n` was zero or larger than the buffer.
    #[error("cannot claim {requested} slots from a buffer of {buffer_size}")]
    InvalidCount { requested: usize, buffer_size: usize },
}

/// Invalid ring buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("buffer size must be a power of two, got {0}")]
    BufferSizeNotPowerOfTwo(usize),
    #[error("buffer size {0} exceeds the largest supported ring")]
    BufferSizeTooLarge(usize),
    #[error("unknown wait strategy: {0:?}")]
    UnknownWaitStrategy(String),
}

/// Error starting a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcessorError {
    #[error("event processor is already running")]
    AlreadyRunning,
    #[error("event processor no longer gates its ring buffer")]
    Released,
}

/// Fault raised by a user event handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A handler callback panicked; carries the panic message when it was a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event handler panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_values_are_zero_sized() {
        assert_eq!(std::mem::size_of::<Alert>(), 0);
        assert_eq!(std::mem::size_of::<InsufficientCapacity>(), 0);
        assert!(std::mem::size_of::<WaitError>() <= 1);
    }

    #[test]
    fn test_conversions_and_messages() {
        assert_eq!(WaitError::from(Alert), WaitError::Alert(Alert));
        assert_eq!(
            ClaimError::from(InsufficientCapacity),
            ClaimError::InsufficientCapacity(InsufficientCapacity)
        );
        assert_eq!(WaitError::Alert(Alert).to_string(), "sequence barrier alerted");
        assert_eq!(
            ClaimError::InvalidCount {
                requested: 9,
                buffer_size: 8
            }
            .to_string(),
            "cannot claim 9 slots from a buffer of 8"
        );
        assert_eq!(
            ConfigError::BufferSizeNotPowerOfTwo(6).to_string(),
            "buffer size must be a power of two, got 6"
        );
    }

    #[test]
    fn test_panic_payload_message() {
        fn formatted() {
            panic!("boom {}", 7);
        }
        fn opaque() {
            std::panic::panic_any(3u8);
        }

        let payload = std::panic::catch_unwind(formatted).unwrap_err();
        assert_eq!(HandlerPanic::from_payload(&*payload).message, "boom 7");

        let payload = std::panic::catch_unwind(opaque).unwrap_err();
        assert_eq!(
            HandlerPanic::from_payload(&*payload).to_string(),
            "event handler panicked: non-string panic payload"
        );
    }
}
