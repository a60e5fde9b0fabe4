//! Consumer loop that feeds ring buffer events to a handler in batches.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use super::barrier::SequenceBarrier;
use super::error::{HandlerError, HandlerPanic, ProcessorError, WaitError};
use super::ring_buffer::RingBuffer;
use crate::sequence::{Sequence, SequenceReader};
use crate::trace::{debug, error, warn};

/// User callback receiving events from a [`BatchEventProcessor`].
pub trait EventHandler<E>: Send {
    /// Processes one event. `end_of_batch` is set on the last event of the
    /// batch the barrier returned; a handler can flush there.
    ///
    /// # Errors
    ///
    /// Any error is passed to the processor's [`ExceptionHandler`] and the
    /// loop moves on to the next event.
    fn on_event(&mut self, event: &E, sequence: i64, end_of_batch: bool)
    -> Result<(), HandlerError>;

    /// Called before each non-empty batch with its size.
    fn on_batch_start(&mut self, _batch_size: i64) {}

    /// # Errors
    ///
    /// Reported to [`ExceptionHandler::handle_on_start_exception`].
    fn on_start(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// # Errors
    ///
    /// Reported to [`ExceptionHandler::handle_on_shutdown_exception`].
    fn on_shutdown(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// The wait strategy timed out; `sequence` is the last processed sequence.
    ///
    /// # Errors
    ///
    /// Reported to [`ExceptionHandler::handle_event_exception`] without an event.
    fn on_timeout(&mut self, _sequence: i64) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Receives faults raised by an [`EventHandler`], including caught panics.
pub trait ExceptionHandler<E>: Send {
    /// `event` is `None` for faults raised outside a specific event, such as `on_timeout`.
    fn handle_event_exception(&mut self, error: HandlerError, sequence: i64, event: Option<&E>);

    fn handle_on_start_exception(&mut self, error: HandlerError);

    fn handle_on_shutdown_exception(&mut self, error: HandlerError);
}

/// Logs every fault at error level and carries on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
impl<E> ExceptionHandler<E> for LoggingExceptionHandler {
    fn handle_event_exception(&mut self, error: HandlerError, sequence: i64, event: Option<&E>) {
        error!(%error, sequence, with_event = event.is_some(), "event handler failed");
    }

    fn handle_on_start_exception(&mut self, error: HandlerError) {
        error!(%error, "event handler failed on start");
    }

    fn handle_on_shutdown_exception(&mut self, error: HandlerError) {
        error!(%error, "event handler failed on shutdown");
    }
}

/// Something that can be run on a thread and stopped from another.
pub trait EventProcessor: Send + Sync {
    /// Sequence of the last event this processor finished with.
    fn sequence(&self) -> &SequenceReader;

    /// Asks a running processor to stop after its current event.
    fn halt(&self);

    /// True from [`run`](Self::run) until it returns. A processor halted
    /// before it was ever started also reports true, until `run` is called
    /// and exits early.
    fn is_running(&self) -> bool;

    /// Runs the processing loop on the calling thread until halted.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::AlreadyRunning`] if another thread is already running it,
    /// [`ProcessorError::Released`] once it has stopped gating its ring.
    fn run(&self) -> Result<(), ProcessorError>;
}

const IDLE: u8 = 0;
const HALTED: u8 = 1;
const RUNNING: u8 = 2;
const RELEASED: u8 = 3;

/// Single-threaded consumer of a ring buffer.
///
/// The processor waits on its barrier, hands every available event to the
/// handler in sequence order and then advances its own sequence once per
/// batch. On construction that sequence is added to the ring's gating set,
/// so producers never overwrite an event the processor has not seen.
pub struct BatchEventProcessor<E, H> {
    state: AtomicU8,
    ring_buffer: Arc<RingBuffer<E>>,
    barrier: SequenceBarrier,
    handler: Mutex<H>,
    exception_handler: Mutex<Box<dyn ExceptionHandler<E>>>,
    sequence: Arc<Sequence>,
    reader: SequenceReader,
}

impl<E, H> BatchEventProcessor<E, H>
where
    E: Send + Sync + 'static,
    H: EventHandler<E>,
{
    /// Creates a processor reading through `barrier` and gating `ring_buffer`.
    ///
    /// The processor's sequence joins at the ring's current cursor.
    ///
    /// # Panics
    ///
    /// If `barrier` was not created by `ring_buffer`.
    pub fn new(ring_buffer: Arc<RingBuffer<E>>, barrier: SequenceBarrier, handler: H) -> Self {
        assert!(
            Arc::as_ptr(barrier.sequencer()).cast::<()>()
                == Arc::as_ptr(ring_buffer.sequencer()).cast::<()>(),
            "sequence barrier belongs to a different ring buffer"
        );
        let sequence = Arc::new(Sequence::default());
        ring_buffer.add_gating_sequences(&[Arc::clone(&sequence)]);
        Self {
            state: AtomicU8::new(IDLE),
            ring_buffer,
            barrier,
            handler: Mutex::new(handler),
            exception_handler: Mutex::new(Box::new(LoggingExceptionHandler)),
            reader: SequenceReader::from(Arc::clone(&sequence)),
            sequence,
        }
    }

    #[must_use]
    pub fn with_exception_handler(self, exception_handler: Box<dyn ExceptionHandler<E>>) -> Self {
        *self.exception_handler.lock() = exception_handler;
        self
    }

    pub fn set_exception_handler(&self, exception_handler: Box<dyn ExceptionHandler<E>>) {
        *self.exception_handler.lock() = exception_handler;
    }

    #[must_use]
    pub fn barrier(&self) -> &SequenceBarrier {
        &self.barrier
    }

    /// Removes this processor from the ring's gating set so it no longer
    /// holds producers back. The processor can not be run afterwards.
    ///
    /// Returns false, changing nothing, while the processor is running or if
    /// it was already released.
    pub fn release_gating(&self) -> bool {
        let Some(_handler) = self.handler.try_lock() else {
            return false;
        };
        let released = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                matches!(state, IDLE | HALTED).then_some(RELEASED)
            })
            .is_ok();
        if released {
            debug!(sequence = self.sequence.get(), "processor released from gating");
        }
        released && self.ring_buffer.remove_gating_sequence(&self.sequence)
    }

    /// Consumes the processor and returns its handler.
    pub fn into_handler(self) -> H {
        self.handler.into_inner()
    }

    fn process_events(&self, handler: &mut H) {
        let mut next_sequence = self.sequence.get() + 1;

        loop {
            match self.barrier.wait_for(next_sequence) {
                Ok(available) => {
                    if available < next_sequence {
                        continue;
                    }
                    handler.on_batch_start(available - next_sequence + 1);
                    while next_sequence <= available {
                        self.deliver(handler, next_sequence, next_sequence == available);
                        next_sequence += 1;
                    }
                    self.sequence.set(available);
                }
                Err(WaitError::Timeout) => self.notify_timeout(handler, self.sequence.get()),
                Err(WaitError::Alert(_)) => {
                    if self.state.load(Ordering::Acquire) != RUNNING {
                        break;
                    }
                    // Not ours. Clear it, then re-check so a racing halt isn't lost.
                    warn!(sequence = next_sequence, "spurious barrier alert");
                    self.barrier.clear_alert();
                    if self.state.load(Ordering::Acquire) != RUNNING {
                        break;
                    }
                }
            }
        }
    }

    fn deliver(&self, handler: &mut H, sequence: i64, end_of_batch: bool) {
        // SAFETY: the barrier returned `sequence` as published, and our own
        // gating sequence is still below it, so no producer can reclaim the slot.
        let event = unsafe { self.ring_buffer.get(sequence) };
        if let Err(error) = guarded(|| handler.on_event(event, sequence, end_of_batch)) {
            self.exception_handler
                .lock()
                .handle_event_exception(error, sequence, Some(event));
        }
    }

    fn notify_timeout(&self, handler: &mut H, sequence: i64) {
        if let Err(error) = guarded(|| handler.on_timeout(sequence)) {
            self.exception_handler
                .lock()
                .handle_event_exception(error, sequence, None);
        }
    }

    fn notify_start(&self, handler: &mut H) {
        if let Err(error) = guarded(|| handler.on_start()) {
            self.exception_handler
                .lock()
                .handle_on_start_exception(error);
        }
    }

    fn notify_shutdown(&self, handler: &mut H) {
        if let Err(error) = guarded(|| handler.on_shutdown()) {
            self.exception_handler
                .lock()
                .handle_on_shutdown_exception(error);
        }
    }

    fn early_exit(&self) -> Result<(), ProcessorError> {
        let mut handler = self.handler.lock();
        if self.state.load(Ordering::Acquire) == RELEASED {
            return Err(ProcessorError::Released);
        }
        self.notify_start(&mut handler);
        self.notify_shutdown(&mut handler);
        // A run that started meanwhile owns the state.
        let _ = self
            .state
            .compare_exchange(HALTED, IDLE, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }
}

impl<E, H> EventProcessor for BatchEventProcessor<E, H>
where
    E: Send + Sync + 'static,
    H: EventHandler<E>,
{
    fn sequence(&self) -> &SequenceReader {
        &self.reader
    }

    fn halt(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != RELEASED).then_some(HALTED)
            });
        self.barrier.alert();
    }

    fn is_running(&self) -> bool {
        !matches!(self.state.load(Ordering::Acquire), IDLE | RELEASED)
    }

    fn run(&self) -> Result<(), ProcessorError> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(ProcessorError::AlreadyRunning),
            Err(RELEASED) => return Err(ProcessorError::Released),
            Err(_) => {
                debug!("processor halted before start");
                return self.early_exit();
            }
        }

        self.barrier.clear_alert();
        let mut handler = self.handler.lock();
        self.notify_start(&mut handler);
        debug!(sequence = self.sequence.get(), "processor started");

        if self.state.load(Ordering::Acquire) == RUNNING {
            self.process_events(&mut handler);
        }

        self.notify_shutdown(&mut handler);
        debug!(sequence = self.sequence.get(), "processor stopped");
        self.state.store(IDLE, Ordering::Release);
        drop(handler);
        Ok(())
    }
}

/// Runs a handler callback, turning a panic into a [`HandlerPanic`] fault.
fn guarded(callback: impl FnOnce() -> Result<(), HandlerError>) -> Result<(), HandlerError> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => Err(Box::new(HandlerPanic::from_payload(&*payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruptor::wait_strategy::{BlockingWaitStrategy, YieldingWaitStrategy};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(i64, bool)>>>,
        batches: Arc<Mutex<Vec<i64>>>,
    }

    impl EventHandler<u64> for Recorder {
        fn on_event(
            &mut self,
            _event: &u64,
            sequence: i64,
            end_of_batch: bool,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push((sequence, end_of_batch));
            Ok(())
        }

        fn on_batch_start(&mut self, batch_size: i64) {
            self.batches.lock().push(batch_size);
        }
    }

    fn ring() -> Arc<RingBuffer<u64>> {
        let wait_strategy = Arc::new(YieldingWaitStrategy::default());
        Arc::new(RingBuffer::create_single_producer(|| 0u64, 16, wait_strategy).unwrap())
    }

    #[test]
    fn test_registers_as_gating_sequence() {
        let ring = ring();
        let processor = BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Recorder::default(),
        );
        assert_eq!(ring.sequencer().minimum_sequence(), -1);
        assert!(processor.release_gating());
        assert!(!processor.release_gating());
    }

    #[test]
    fn test_batches_end_on_last_available() {
        let ring = ring();
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let batches = Arc::clone(&recorder.batches);
        let processor = Arc::new(BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            recorder,
        ));

        // Publish before starting so the first wait returns all three.
        ring.publish_events(3, |event, sequence| *event = sequence as u64).unwrap();

        let runner = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.run())
        };
        while processor.sequence().get() < 2 {
            thread::yield_now();
        }
        processor.halt();
        assert_eq!(runner.join().unwrap(), Ok(()));

        assert_eq!(*seen.lock(), vec![(0, false), (1, false), (2, true)]);
        assert_eq!(*batches.lock(), vec![3]);
        assert!(!processor.is_running());
    }

    #[test]
    fn test_halt_before_run_exits_early() {
        struct Lifecycle(Arc<Mutex<Vec<&'static str>>>);

        impl EventHandler<u64> for Lifecycle {
            fn on_event(&mut self, _: &u64, _: i64, _: bool) -> Result<(), HandlerError> {
                self.0.lock().push("event");
                Ok(())
            }

            fn on_start(&mut self) -> Result<(), HandlerError> {
                self.0.lock().push("start");
                Ok(())
            }

            fn on_shutdown(&mut self) -> Result<(), HandlerError> {
                self.0.lock().push("shutdown");
                Ok(())
            }
        }

        let ring = ring();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let processor = BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Lifecycle(Arc::clone(&calls)),
        );
        ring.publish_event(|event, _| *event = 1);

        processor.halt();
        // Halted but never started still counts as running until `run`.
        assert!(processor.is_running());
        assert_eq!(processor.run(), Ok(()));
        assert!(!processor.is_running());
        assert_eq!(*calls.lock(), vec!["start", "shutdown"]);
    }

    #[test]
    fn test_halt_wakes_blocking_wait() {
        let ring = Arc::new(
            RingBuffer::create_multi_producer(|| 0u64, 8, Arc::new(BlockingWaitStrategy::new()))
                .unwrap(),
        );
        let processor = Arc::new(BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Recorder::default(),
        ));

        let runner = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.run())
        };
        while !processor.is_running() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));

        processor.halt();
        assert_eq!(runner.join().unwrap(), Ok(()));
        assert!(!processor.is_running());
        assert_eq!(processor.sequence().get(), -1);
    }

    struct Gate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl EventHandler<u64> for Gate {
        fn on_event(&mut self, _: &u64, _: i64, _: bool) -> Result<(), HandlerError> {
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_release_refused_while_running() {
        let ring = ring();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let processor = Arc::new(BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Gate {
                entered: entered_tx,
                release: release_rx,
            },
        ));
        ring.publish_event(|event, _| *event = 1);

        let runner = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.run())
        };
        entered_rx.recv().unwrap();

        // Mid-event: the slot must stay gated.
        assert!(!processor.release_gating());
        assert_eq!(ring.minimum_gating_sequence(), -1);

        processor.halt();
        release_tx.send(()).unwrap();
        assert_eq!(runner.join().unwrap(), Ok(()));

        assert!(processor.release_gating());
        assert_eq!(ring.minimum_gating_sequence(), ring.cursor());
    }

    #[test]
    fn test_released_processor_cannot_run() {
        let ring = ring();
        let processor = BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Recorder::default(),
        );
        assert!(processor.release_gating());

        processor.halt();
        assert!(!processor.is_running());
        assert_eq!(processor.run(), Err(ProcessorError::Released));
        assert!(!processor.release_gating());
    }

    #[test]
    #[should_panic(expected = "different ring buffer")]
    fn test_rejects_foreign_barrier() {
        let own = ring();
        let other = ring();
        let _ = BatchEventProcessor::new(own, other.new_barrier(&[]), Recorder::default());
    }
}
