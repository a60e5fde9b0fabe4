//! Multicast sequencing ring.
//!
//! Producers claim sequences from a [`Sequencer`], fill the pre-allocated
//! events of a [`RingBuffer`] in place and publish them. Every consumer stage
//! sees every event: a [`BatchEventProcessor`] waits on a [`SequenceBarrier`],
//! hands whole batches to its [`EventHandler`] and advances its own
//! [`Sequence`](crate::sequence::Sequence), which gates producers from
//! lapping it. Stages depend on each other by building their barrier over
//! upstream processor sequences.
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::disruptor::{
//!     BatchEventProcessor, EventHandler, EventProcessor, HandlerError, RingBuffer,
//!     YieldingWaitStrategy,
//! };
//!
//! struct Sum(u64);
//!
//! impl EventHandler<u64> for Sum {
//!     fn on_event(&mut self, event: &u64, _: i64, _: bool) -> Result<(), HandlerError> {
//!         self.0 += event;
//!         Ok(())
//!     }
//! }
//!
//! let ring = Arc::new(RingBuffer::create_single_producer(
//!     || 0u64,
//!     64,
//!     Arc::new(YieldingWaitStrategy::default()),
//! )?);
//! let processor = Arc::new(BatchEventProcessor::new(
//!     Arc::clone(&ring),
//!     ring.new_barrier(&[]),
//!     Sum(0),
//! ));
//!
//! let worker = {
//!     let processor = Arc::clone(&processor);
//!     std::thread::spawn(move || processor.run())
//! };
//! for value in 1..=10 {
//!     ring.publish_event(|event, _| *event = value);
//! }
//! while processor.sequence().get() < 9 {
//!     std::thread::yield_now();
//! }
//! processor.halt();
//! worker.join().unwrap()?;
//! let processor = Arc::into_inner(processor).unwrap();
//! assert_eq!(processor.into_handler().0, 55);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod barrier;
mod config;
mod error;
mod executor;
mod processor;
mod ring_buffer;
mod sequence_group;
mod sequencer;
mod wait_strategy;

pub use barrier::{AlertFlag, SequenceBarrier};
pub use config::{ProducerType, RingBufferConfig};
pub use error::{
    Alert, ClaimError, ConfigError, HandlerError, HandlerPanic, InsufficientCapacity,
    ProcessorError, WaitError,
};
pub use executor::{Executor, Task, ThreadExecutor};
pub use processor::{
    BatchEventProcessor, EventHandler, EventProcessor, ExceptionHandler, LoggingExceptionHandler,
};
pub use ring_buffer::{EventFactory, RingBuffer};
pub use sequence_group::{FixedSequenceGroup, SequenceGroup};
pub use sequencer::{
    MAX_BUFFER_SIZE, MultiProducerSequencer, Sequencer, SingleProducerSequencer,
    validate_buffer_size,
};
pub use wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, TimeoutBlockingWaitStrategy, WaitStrategy,
    WaitStrategyKind, YieldingWaitStrategy,
};
