//! Producer/processor scenarios on the multicast ring.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=turnstile=debug cargo test --features tracing --test ring_scenarios -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use turnstile::disruptor::{
    BatchEventProcessor, BlockingWaitStrategy, EventHandler, EventProcessor, ExceptionHandler,
    HandlerError, ProcessorError, RingBuffer, Sequencer, ThreadExecutor, YieldingWaitStrategy,
};
use turnstile::sequence::{Sequence, SequenceReader};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        turnstile::init_tracing();
    });
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

/// Counts events; optionally blocks on each until `gate` opens.
struct Counting {
    delivered: Arc<AtomicUsize>,
    entered: Arc<AtomicBool>,
    gate: Option<Arc<AtomicBool>>,
}

impl Counting {
    fn new() -> Self {
        Self {
            delivered: Arc::new(AtomicUsize::new(0)),
            entered: Arc::new(AtomicBool::new(false)),
            gate: None,
        }
    }

    fn gated(gate: &Arc<AtomicBool>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
            ..Self::new()
        }
    }
}

impl EventHandler<u64> for Counting {
    fn on_event(&mut self, _: &u64, _: i64, _: bool) -> Result<(), HandlerError> {
        self.entered.store(true, Ordering::Release);
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::Acquire) {
                thread::yield_now();
            }
        }
        self.delivered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[test]
fn fifth_claim_waits_for_gating_consumer() {
    init_test_tracing();

    let ring = Arc::new(
        RingBuffer::create_single_producer(|| 0u64, 4, Arc::new(YieldingWaitStrategy::default()))
            .unwrap(),
    );
    let consumer = Arc::new(Sequence::default());
    ring.add_gating_sequences(&[Arc::clone(&consumer)]);

    for value in 0..4 {
        ring.publish_event(|event, _| *event = value);
    }
    assert_eq!(ring.cursor(), 3);
    assert!(!ring.has_available_capacity(1));

    let producer = {
        let ring = Arc::clone(&ring);
        // SAFETY: the main thread publishes nothing until this claim returns.
        thread::spawn(move || unsafe { ring.next() })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished(), "claim of sequence 4 overtook the consumer");

    consumer.set(0);
    let claimed = producer.join().unwrap();
    assert_eq!(claimed, 4);
    // SAFETY: claimed above and the claiming thread has finished.
    unsafe { ring.publish(claimed) };
    assert_eq!(ring.cursor(), 4);
}

#[test]
fn fast_producer_stalls_at_slow_consumer() {
    init_test_tracing();

    const EVENTS: u64 = 100;

    let ring = Arc::new(
        RingBuffer::create_single_producer(|| 0u64, 4, Arc::new(YieldingWaitStrategy::default()))
            .unwrap(),
    );
    let gate = Arc::new(AtomicBool::new(false));
    let handler = Counting::gated(&gate);
    let delivered = Arc::clone(&handler.delivered);
    let entered = Arc::clone(&handler.entered);
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[]),
        handler,
    ));

    let executor = ThreadExecutor::new("slow-consumer");
    executor.spawn_processor(Arc::clone(&processor)).unwrap();

    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for value in 0..EVENTS {
                ring.publish_event(|event, _| *event = value);
            }
        })
    };

    wait_until(|| entered.load(Ordering::Acquire));
    thread::sleep(Duration::from_millis(50));
    // The processor is stuck inside sequence 0 and still reports -1.
    assert_eq!(processor.sequence().get(), -1);
    assert_eq!(ring.cursor(), 3);
    assert!(!producer.is_finished());

    gate.store(true, Ordering::Release);
    producer.join().unwrap();
    wait_until(|| processor.sequence().get() == EVENTS as i64 - 1);
    assert_eq!(delivered.load(Ordering::Acquire), EVENTS as usize);

    processor.halt();
    assert_eq!(executor.join_all(), 0);
    assert!(!processor.is_running());
}

#[test]
fn reordered_publish_exposes_contiguous_prefix() {
    init_test_tracing();

    let wait_strategy = Arc::new(YieldingWaitStrategy::default());
    let ring = RingBuffer::create_multi_producer(|| 0u64, 8, wait_strategy).unwrap();
    let barrier = ring.new_barrier(&[]);

    // SAFETY: multi-producer claims, each published once, nothing reads the slots.
    let (n, n1, n2) = unsafe { (ring.next(), ring.next(), ring.next()) };
    assert_eq!((n, n1, n2), (0, 1, 2));

    unsafe {
        ring.publish(n);
        ring.publish(n2);
    }
    assert_eq!(ring.highest_published_sequence(n, n2), n);
    assert_eq!(barrier.wait_for(n), Ok(n));
    assert!(!ring.is_available(n1));

    unsafe { ring.publish(n1) };
    assert_eq!(barrier.wait_for(n1), Ok(n2));
}

#[test]
fn halt_wakes_blocked_processor() {
    init_test_tracing();

    let ring = Arc::new(
        RingBuffer::create_multi_producer(|| 0u64, 16, Arc::new(BlockingWaitStrategy::new()))
            .unwrap(),
    );
    let handler = Counting::new();
    let delivered = Arc::clone(&handler.delivered);
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[]),
        handler,
    ));

    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    wait_until(|| processor.is_running());
    thread::sleep(Duration::from_millis(20));

    let halted_at = Instant::now();
    processor.halt();
    assert_eq!(runner.join().unwrap(), Ok(()));
    assert!(halted_at.elapsed() < Duration::from_secs(1));
    assert!(!processor.is_running());

    ring.publish_event(|event, _| *event = 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(delivered.load(Ordering::Acquire), 0);
}

#[derive(Default)]
struct Faults {
    reported: Arc<Mutex<Vec<(i64, String, Option<u64>)>>>,
}

impl ExceptionHandler<u64> for Faults {
    fn handle_event_exception(&mut self, error: HandlerError, sequence: i64, event: Option<&u64>) {
        self.reported
            .lock()
            .push((sequence, error.to_string(), event.copied()));
    }

    fn handle_on_start_exception(&mut self, error: HandlerError) {
        panic!("unexpected start fault: {error}");
    }

    fn handle_on_shutdown_exception(&mut self, error: HandlerError) {
        panic!("unexpected shutdown fault: {error}");
    }
}

struct Flaky {
    seen: Arc<Mutex<Vec<i64>>>,
}

impl EventHandler<u64> for Flaky {
    fn on_event(&mut self, event: &u64, sequence: i64, _: bool) -> Result<(), HandlerError> {
        match *event {
            2 => return Err("rejected event 2".into()),
            4 => panic!("handler exploded"),
            _ => {}
        }
        self.seen.lock().push(sequence);
        Ok(())
    }
}

#[test]
fn handler_faults_do_not_stop_the_stream() {
    init_test_tracing();

    let ring = Arc::new(
        RingBuffer::create_single_producer(|| 0u64, 8, Arc::new(YieldingWaitStrategy::default()))
            .unwrap(),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let faults = Faults::default();
    let reported = Arc::clone(&faults.reported);
    let processor = Arc::new(
        BatchEventProcessor::new(
            Arc::clone(&ring),
            ring.new_barrier(&[]),
            Flaky {
                seen: Arc::clone(&seen),
            },
        )
        .with_exception_handler(Box::new(faults)),
    );

    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    for value in 0..20u64 {
        ring.publish_event(|event, _| *event = value);
    }
    wait_until(|| processor.sequence().get() == 19);
    processor.halt();
    runner.join().unwrap().unwrap();

    let expected: Vec<i64> = (0..20).filter(|s| *s != 2 && *s != 4).collect();
    assert_eq!(*seen.lock(), expected);

    let reported = reported.lock();
    assert_eq!(reported.len(), 2);
    assert_eq!(reported[0], (2, "rejected event 2".to_owned(), Some(2)));
    assert_eq!(reported[1].0, 4);
    assert!(reported[1].1.contains("handler exploded"));
    assert_eq!(reported[1].2, Some(4));
}

#[test]
fn second_run_is_rejected() {
    init_test_tracing();

    let ring = Arc::new(
        RingBuffer::create_multi_producer(|| 0u64, 8, Arc::new(YieldingWaitStrategy::default()))
            .unwrap(),
    );
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[]),
        Counting::new(),
    ));

    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    wait_until(|| processor.is_running());

    assert_eq!(processor.run(), Err(ProcessorError::AlreadyRunning));

    processor.halt();
    assert_eq!(runner.join().unwrap(), Ok(()));

    // Idle again, so it can be restarted.
    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    wait_until(|| processor.is_running());
    processor.halt();
    assert_eq!(runner.join().unwrap(), Ok(()));
}

/// Checks that an upstream stage finished each event before this one sees it.
struct Downstream {
    upstream: SequenceReader,
    violations: Arc<AtomicUsize>,
}

impl EventHandler<u64> for Downstream {
    fn on_event(&mut self, _: &u64, sequence: i64, _: bool) -> Result<(), HandlerError> {
        if self.upstream.get() < sequence {
            self.violations.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[test]
fn dependent_stage_trails_its_upstream() {
    init_test_tracing();

    const EVENTS: i64 = 5_000;

    let ring = Arc::new(
        RingBuffer::create_multi_producer(|| 0u64, 64, Arc::new(YieldingWaitStrategy::default()))
            .unwrap(),
    );
    let first = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[]),
        Counting::new(),
    ));
    let violations = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[first.sequence().clone()]),
        Downstream {
            upstream: first.sequence().clone(),
            violations: Arc::clone(&violations),
        },
    ));

    let executor = ThreadExecutor::new("pipeline");
    executor.spawn_processor(Arc::clone(&first)).unwrap();
    executor.spawn_processor(Arc::clone(&second)).unwrap();

    let producers: Vec<_> = (0..2)
        .map(|_| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for _ in 0..EVENTS / 2 {
                    ring.publish_event(|event, sequence| *event = sequence as u64);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    wait_until(|| second.sequence().get() == EVENTS - 1);
    assert_eq!(violations.load(Ordering::Acquire), 0);
    assert!(first.sequence().get() >= second.sequence().get());
    assert_eq!(ring.sequencer().minimum_sequence(), EVENTS - 1);

    first.halt();
    second.halt();
    assert_eq!(executor.join_all(), 0);
}
