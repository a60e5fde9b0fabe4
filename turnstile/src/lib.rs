//! Lock-free inter-thread messaging.
//!
//! * [`queue`]: bounded point-to-point queues for every producer/consumer
//!   cardinality (SPSC, MPSC, SPMC, MPMC).
//! * [`disruptor`]: a multicast ring where every consumer stage sees every
//!   event, with configurable wait strategies and stage dependencies.
//! * [`sequence`]: the cache-line padded counter both halves coordinate on.
//!
//! Logging goes through `tracing` behind the `tracing` feature; call
//! [`init_tracing`] to print it.

pub mod disruptor;
pub mod queue;
pub mod sequence;

mod slots;
mod trace;

pub use trace::init_tracing;
