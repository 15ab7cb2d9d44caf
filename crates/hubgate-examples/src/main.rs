use std::convert::Infallible;
use std::future::Ready;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hubgate_core::prometheus::render_stats;
use hubgate_tower::{Admission, HubGate, LimiterConfig, Priority};
use tower::{Service, ServiceExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Async hub simulation: motion/door events arrive in bursts while a poller
// refreshes device state. Both go through one admission layer in front of
// the hub. Limits are scaled down so the run finishes in seconds.

const HUB_CONFIG: &str = r#"{
    "default_rate_limit": 5,
    "default_time_window": 0.6,
    "per_priority": {
        "2": { "min_calls": 3, "floor_window": 3.0, "latest_only": true }
    }
}"#;

#[derive(Clone, Debug)]
enum HubCommand {
    Event { device: &'static str, action: &'static str },
    Refresh { seq: u64 },
}

impl HubCommand {
    fn priority(&self) -> Priority {
        match self {
            HubCommand::Event { .. } => Priority::EVENT,
            HubCommand::Refresh { .. } => Priority::POLLING,
        }
    }
}

/// Stand-in for the hub's HTTP API.
#[derive(Clone)]
struct Hub {
    started: Instant,
    calls: Arc<AtomicU64>,
}

impl Service<HubCommand> for Hub {
    type Response = String;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, cmd: HubCommand) -> Self::Future {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let at = self.started.elapsed().as_secs_f64();
        let line = match cmd {
            HubCommand::Event { device, action } => format!("{at:6.2}s {device} <- {action}"),
            HubCommand::Refresh { seq } => format!("{at:6.2}s refresh #{seq}"),
        };
        std::future::ready(Ok(line))
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: LimiterConfig = match serde_json::from_str(HUB_CONFIG) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "bad hub config");
            return;
        }
    };
    let layer = match HubGate::from_config(config).build(HubCommand::priority) {
        Ok(layer) => layer,
        Err(err) => {
            warn!(error = %err, "rejected hub config");
            return;
        }
    };
    let limiter = layer.limiter().clone();

    let hub = Hub {
        started: Instant::now(),
        calls: Arc::new(AtomicU64::new(0)),
    };
    let hub_calls = Arc::clone(&hub.calls);
    let service = tower::ServiceBuilder::new().layer(layer).service(hub);

    let running = Arc::new(AtomicBool::new(true));
    let skipped_refreshes = Arc::new(AtomicU64::new(0));

    let events = {
        let service = service.clone();
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let devices = ["hall_light", "front_door", "thermostat", "porch_light"];
            let mut tick = 0usize;
            let mut inflight = Vec::new();
            while running.load(Ordering::Relaxed) {
                tick += 1;
                // Bursts of four commands every 400ms run just past the hub limit.
                for device in devices {
                    let cmd = HubCommand::Event {
                        device,
                        action: if tick % 2 == 0 { "off" } else { "on" },
                    };
                    inflight.push(tokio::spawn(service.clone().oneshot(cmd)));
                }
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            for handle in inflight {
                if let Ok(Ok(Admission::Completed(line))) = handle.await {
                    info!("{line}");
                }
            }
        })
    };

    let poller = {
        let service = service.clone();
        let running = Arc::clone(&running);
        let skipped = Arc::clone(&skipped_refreshes);
        tokio::spawn(async move {
            let mut seq = 0u64;
            let mut inflight = Vec::new();
            while running.load(Ordering::Relaxed) {
                seq += 1;
                inflight.push(tokio::spawn(
                    service.clone().oneshot(HubCommand::Refresh { seq }),
                ));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            for handle in inflight {
                match handle.await {
                    Ok(Ok(Admission::Completed(line))) => info!("{line}"),
                    Ok(Ok(Admission::Superseded)) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        })
    };

    let run_for = Duration::from_secs(6);
    println!(
        "simulating hub traffic for {:.1}s...",
        run_for.as_secs_f64()
    );
    tokio::time::sleep(run_for).await;
    running.store(false, Ordering::Relaxed);

    let _ = events.await;
    let _ = poller.await;

    let stats = limiter.stats();
    println!(
        "hub_calls={} refreshes_skipped={} granted={} superseded={} pending={}",
        hub_calls.load(Ordering::Relaxed),
        skipped_refreshes.load(Ordering::Relaxed),
        stats.granted,
        stats.superseded,
        stats.pending
    );
    for entry in &stats.priorities {
        println!(
            "  {}: granted={} superseded={} floor={:?}",
            entry.priority, entry.granted, entry.superseded, entry.floor_progress
        );
    }
    println!();
    print!("{}", render_stats(&stats, "hubgate"));
}
