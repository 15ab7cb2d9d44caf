use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hubgate_core::{Limiter, LimiterConfig, Outcome, Priority};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Thread-per-caller demo using the hub defaults (overridable through
// HUBGATE_RATE_LIMIT / HUBGATE_RATE_WINDOW): a burst of events, then three
// stale refreshes that collapse into one.

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let limiter = match LimiterConfig::from_env().and_then(Limiter::new) {
        Ok(limiter) => Arc::new(limiter),
        Err(err) => {
            warn!(error = %err, "cannot start limiter");
            std::process::exit(1);
        }
    };
    let started = Instant::now();

    let mut handles = Vec::new();
    for n in 0..8 {
        let limiter = Arc::clone(&limiter);
        handles.push(thread::spawn(move || {
            let outcome = limiter.acquire(Priority::EVENT);
            info!(
                at_ms = started.elapsed().as_millis() as u64,
                ?outcome,
                "event #{n}"
            );
        }));
    }

    thread::sleep(Duration::from_millis(50));
    for seq in 0..3 {
        let limiter = Arc::clone(&limiter);
        handles.push(thread::spawn(move || {
            match limiter.acquire(Priority::POLLING) {
                Outcome::Granted => info!(
                    at_ms = started.elapsed().as_millis() as u64,
                    "refresh #{seq} sent"
                ),
                Outcome::Superseded => info!("refresh #{seq} skipped, a newer one is queued"),
            }
        }));
        thread::sleep(Duration::from_millis(10));
    }

    for handle in handles {
        let _ = handle.join();
    }

    let stats = limiter.stats();
    println!(
        "granted={} superseded={} available={}/{}",
        stats.granted, stats.superseded, stats.available_tokens, stats.capacity
    );
}
