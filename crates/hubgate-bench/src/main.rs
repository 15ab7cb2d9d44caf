use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use hubgate_core::{Limiter, LimiterConfig, Outcome, Priority, PriorityPolicy};
use tracing_subscriber::EnvFilter;

// Saturates the hub with event traffic and checks that the polling floor
// still gets its calls through.

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let run_seconds = 6u64;
    let event_threads = 8usize;
    let pollers = 3usize;

    // Scaled-down hub: 10 calls per 200ms, polling guaranteed 2 per second.
    let config = LimiterConfig::new(10, 0.2).with_priority(
        Priority::POLLING,
        PriorityPolicy::default().floor(2, 1.0).latest_only(),
    );
    let limiter = match Limiter::new(config) {
        Ok(limiter) => Arc::new(limiter),
        Err(err) => {
            eprintln!("invalid bench configuration: {err}");
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let event_granted = Arc::new(AtomicU64::new(0));
    let polling_granted = Arc::new(AtomicU64::new(0));
    let polling_superseded = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..event_threads {
        handles.push(spawn_caller(
            Arc::clone(&limiter),
            Arc::clone(&running),
            Priority::EVENT,
            Arc::clone(&event_granted),
            None,
            0,
        ));
    }
    for _ in 0..pollers {
        handles.push(spawn_caller(
            Arc::clone(&limiter),
            Arc::clone(&running),
            Priority::POLLING,
            Arc::clone(&polling_granted),
            Some(Arc::clone(&polling_superseded)),
            50,
        ));
    }

    println!(
        "bench: {} event callers vs {} latest-only pollers ({}s)",
        event_threads, pollers, run_seconds
    );
    let start = Instant::now();
    thread::sleep(Duration::from_secs(run_seconds));
    let elapsed = start.elapsed().as_secs_f64();

    running.store(false, Ordering::Relaxed);
    // Callers still queued are admitted by the next refills, then stop.
    for handle in handles {
        let _ = handle.join();
    }

    let events = event_granted.load(Ordering::Relaxed);
    let polls = polling_granted.load(Ordering::Relaxed);
    let capacity_per_second = 10.0 / 0.2;
    println!(
        "granted: event={} polling={} polling_superseded={}",
        events,
        polls,
        polling_superseded.load(Ordering::Relaxed)
    );
    println!(
        "derived: throughput={:.1} calls/s (cap {:.1}) polling_per_s={:.2} (floor 2.00)",
        (events + polls) as f64 / elapsed,
        capacity_per_second,
        polls as f64 / elapsed
    );
}

fn spawn_caller(
    limiter: Arc<Limiter>,
    running: Arc<AtomicBool>,
    priority: Priority,
    granted: Arc<AtomicU64>,
    superseded: Option<Arc<AtomicU64>>,
    interval_ms: u64,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            match limiter.acquire(priority) {
                Outcome::Granted => {
                    granted.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Superseded => {
                    if let Some(counter) = &superseded {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            if interval_ms > 0 {
                thread::sleep(Duration::from_millis(interval_ms));
            }
        }
    })
}
