use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use parking_lot::Mutex;

use dmem::{Heap, HeapCreateInfo, HeapError, HeapPtr, HeapState};

/// Allocation churn driver for the checksummed arena heap.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Arena size in bytes.
    #[arg(long, default_value_t = 4096)]
    arena_size: usize,

    /// Integrity audit period in milliseconds.
    #[arg(long, default_value_t = 100)]
    audit_period_ms: u32,

    /// Number of allocate/free rounds to run.
    #[arg(long, default_value_t = 100_000)]
    rounds: u32,

    /// Churn pattern seed.
    #[arg(long, default_value_t = 0x9E37_79B9)]
    seed: u64,
}

// splitmix64 step, plenty of spread for a churn pattern
fn next_rand(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut x = *state;
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let heap = Heap::new(HeapCreateInfo {
        arena: vec![0u8; args.arena_size].into_boxed_slice(),
        audit_period_ms: Some(args.audit_period_ms),
        on_corruption: Some(Box::new(|| warn!("corruption hook fired"))),
    })
    .expect("create heap");
    info!(
        "arena of {} bytes, {} units",
        args.arena_size,
        heap.capacity_units()
    );

    // the heap has no locking of its own; the mutex is the caller-supplied
    // serialization it expects
    let heap = Arc::new(Mutex::new(heap));
    let done = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let ticker = {
        let heap = Arc::clone(&heap);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                heap.lock().tick(started.elapsed().as_millis() as u32);
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let mut rng = args.seed;
    let mut live: Vec<HeapPtr> = Vec::new();
    let mut served = 0u32;
    let mut refused = 0u32;
    for _ in 0..args.rounds {
        let roll = next_rand(&mut rng);
        if roll % 3 != 0 || live.is_empty() {
            let size = 1 + (roll >> 8) as usize % 96;
            match heap.lock().allocate(size) {
                Ok(ptr) => {
                    live.push(ptr);
                    served += 1;
                }
                Err(HeapError::Exhausted) => {
                    refused += 1;
                    if let Some(ptr) = live.pop() {
                        heap.lock().free(ptr).expect("free under pressure");
                    }
                }
                Err(err) => {
                    warn!("allocation stopped: {err}");
                    break;
                }
            }
        } else {
            let ptr = live.swap_remove((roll >> 40) as usize % live.len());
            heap.lock().free(ptr).expect("free");
        }
    }
    for ptr in live.drain(..) {
        heap.lock().free(ptr).expect("drain");
    }
    done.store(true, Ordering::Relaxed);
    ticker.join().expect("ticker thread");

    let mut heap = heap.lock();
    heap.tick(started.elapsed().as_millis() as u32 + args.audit_period_ms);
    let stats = heap.stats();
    println!(
        "{} served, {} refused, state {:?}",
        served,
        refused,
        heap.state()
    );
    println!(
        "free: {} regions, {} bytes ({:.1}%), largest {}",
        stats.free.count, stats.free.total_bytes, stats.free_pct, stats.free.max_bytes
    );
    println!(
        "allocated: {} regions, {} bytes ({:.1}%)",
        stats.allocated.count, stats.allocated.total_bytes, stats.allocated_pct
    );
    if heap.state() != HeapState::Ready {
        println!(
            "corrupt unit: {:?}",
            stats.corrupt_index
        );
    }
}
