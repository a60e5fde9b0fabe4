//! Queue and ring buffer throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)
//!     RUST_LOG=...    Log filter when built with `--features tracing`

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use turnstile::disruptor::{
    BatchEventProcessor, EventHandler, EventProcessor, HandlerError, RingBuffer,
    RingBufferConfig, WaitStrategyKind,
};
use turnstile::queue::{mpmc, mpsc, spsc};

const QUEUE_SIZE: usize = 1 << 16;
const ITERATIONS: usize = 1 << 24;
const MPSC_PRODUCERS: usize = 3;

type Payload = u64;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn report(name: &str, ops: usize, elapsed: Duration) {
    let ops_per_ms = ops as u128 * 1_000_000 / elapsed.as_nanos().max(1);
    println!("{name:<28} {ops_per_ms:>10} ops/ms");
}

/// Spawns `consume` on a pinned thread and waits until it is ready.
fn spawn_consumer<F>(cpu: Option<usize>, consume: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let handle = thread::spawn(move || {
        pin_to_cpu(cpu);
        ready_clone.store(true, Ordering::Release);
        consume();
    });
    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    handle
}

fn bench_spsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = spsc::channel::<Payload>(QUEUE_SIZE).unwrap();

    let consumer = spawn_consumer(consumer_cpu, move || {
        let mut expected = 0;
        while expected < ITERATIONS as Payload {
            match rx.poll() {
                Some(value) => {
                    assert_eq!(value, expected, "data corruption");
                    expected += 1;
                }
                None => hint::spin_loop(),
            }
        }
    });

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    for i in 0..ITERATIONS as Payload {
        let mut item = i;
        while let Err(rejected) = tx.offer(item) {
            item = rejected;
            hint::spin_loop();
        }
    }
    consumer.join().unwrap();
    report("spsc offer/poll", ITERATIONS, start.elapsed());
}

fn bench_spsc_batched(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = spsc::channel::<Payload>(QUEUE_SIZE).unwrap();

    let consumer = spawn_consumer(consumer_cpu, move || {
        let mut expected = 0;
        while expected < ITERATIONS as Payload {
            let drained = rx.drain(
                |value| {
                    assert_eq!(value, expected, "data corruption");
                    expected += 1;
                },
                256,
            );
            if drained == 0 {
                hint::spin_loop();
            }
        }
    });

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    let mut next = 0 as Payload;
    while next < ITERATIONS as Payload {
        let remaining = ITERATIONS - next as usize;
        let filled = tx.fill(
            || {
                next += 1;
                next - 1
            },
            remaining.min(256),
        );
        if filled == 0 {
            hint::spin_loop();
        }
    }
    consumer.join().unwrap();
    report("spsc fill/drain", ITERATIONS, start.elapsed());
}

fn bench_mpsc(consumer_cpu: Option<usize>) {
    let (tx, rx) = mpsc::channel::<Payload>(QUEUE_SIZE).unwrap();
    let per_producer = ITERATIONS / MPSC_PRODUCERS;
    let total = per_producer * MPSC_PRODUCERS;

    let consumer = spawn_consumer(consumer_cpu, move || {
        let mut received = 0;
        while received < total {
            received += rx.drain(|_| {}, 256);
        }
    });

    let start = Instant::now();
    let producers: Vec<_> = (0..MPSC_PRODUCERS)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer as Payload {
                    let mut item = i;
                    while let Err(rejected) = tx.offer(item) {
                        item = rejected;
                        hint::spin_loop();
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    consumer.join().unwrap();
    report("mpsc 3p/1c offer/drain", total, start.elapsed());
}

fn bench_mpmc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = mpmc::channel::<Payload>(QUEUE_SIZE).unwrap();

    let consumer = spawn_consumer(consumer_cpu, move || {
        let mut received = 0;
        while received < ITERATIONS {
            if rx.poll().is_some() {
                received += 1;
            } else {
                hint::spin_loop();
            }
        }
    });

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    for i in 0..ITERATIONS as Payload {
        let mut item = i;
        while let Err(rejected) = tx.offer(item) {
            item = rejected;
            hint::spin_loop();
        }
    }
    consumer.join().unwrap();
    report("mpmc offer/poll", ITERATIONS, start.elapsed());
}

struct Checksum {
    expected: Payload,
}

impl EventHandler<Payload> for Checksum {
    fn on_event(&mut self, event: &Payload, _: i64, _: bool) -> Result<(), HandlerError> {
        if *event != self.expected {
            return Err(format!("expected {}, got {}", self.expected, event).into());
        }
        self.expected += 1;
        Ok(())
    }
}

fn bench_ring(
    producer_cpu: Option<usize>,
    consumer_cpu: Option<usize>,
    wait_strategy: WaitStrategyKind,
) {
    let config = RingBufferConfig {
        buffer_size: QUEUE_SIZE,
        wait_strategy,
        ..RingBufferConfig::default()
    };
    let ring = Arc::new(RingBuffer::from_config(&config, || 0 as Payload).unwrap());
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        ring.new_barrier(&[]),
        Checksum { expected: 0 },
    ));

    let consumer = {
        let processor = Arc::clone(&processor);
        spawn_consumer(consumer_cpu, move || {
            processor.run().unwrap();
        })
    };

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    for i in 0..ITERATIONS as Payload {
        ring.publish_event(|event, _| *event = i);
    }
    let last = ITERATIONS as i64 - 1;
    while processor.sequence().get() < last {
        hint::spin_loop();
    }
    let elapsed = start.elapsed();
    processor.halt();
    consumer.join().unwrap();
    report(&format!("ring 1p/1c {wait_strategy}"), ITERATIONS, elapsed);
}

fn main() {
    turnstile::init_tracing();

    let (producer_cpu, consumer_cpu) = get_cpu_affinity();
    println!(
        "producer cpu {:?}, consumer cpu {:?}, {} items",
        producer_cpu, consumer_cpu, ITERATIONS
    );

    bench_spsc(producer_cpu, consumer_cpu);
    bench_spsc_batched(producer_cpu, consumer_cpu);
    bench_mpsc(consumer_cpu);
    bench_mpmc(producer_cpu, consumer_cpu);
    for wait_strategy in [
        WaitStrategyKind::BusySpin,
        WaitStrategyKind::Yielding,
        WaitStrategyKind::Blocking,
    ] {
        bench_ring(producer_cpu, consumer_cpu, wait_strategy);
    }
}
