use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::api::{CancelResult, LimiterStats, Outcome, Priority, PriorityStats, TicketHandle};
use crate::bucket::TokenBucket;
use crate::config::LimiterConfig;
use crate::dispatcher::{AdmissionState, DispatcherThread, deliver};
use crate::error::{Error, Result};
use crate::state::{
    BucketChoice, Completion, FloorState, OutcomeSlot, PriorityState, Resolution, StatsCounters,
    Ticket, WorkSignal,
};

/// State shared between callers and the dispatcher thread.
pub(crate) struct Shared {
    pub(crate) state: Mutex<AdmissionState>,
    pub(crate) signal: WorkSignal,
    pub(crate) stats: StatsCounters,
    next_ticket: AtomicU64,
}

impl Shared {
    /// Runs one dispatch cycle and delivers its outcomes after unlocking.
    pub(crate) fn run_cycle(&self, now: Instant) -> Option<Instant> {
        let cycle = self.state.lock().dispatch(now);
        self.record(&cycle.resolutions, cycle.wait_ns);
        deliver(cycle.resolutions);
        cycle.next_wakeup
    }

    fn record(&self, resolutions: &[Resolution], wait_ns: u64) {
        let granted = resolutions
            .iter()
            .filter(|resolution| resolution.outcome.is_granted())
            .count() as u64;
        let superseded = resolutions.len() as u64 - granted;
        StatsCounters::add(&self.stats.granted, granted);
        StatsCounters::add(&self.stats.superseded, superseded);
        StatsCounters::sub(&self.stats.pending, resolutions.len() as u64);
        StatsCounters::add(&self.stats.wait_time_sum_ns, wait_ns);
        StatsCounters::add(&self.stats.wait_time_samples, granted);
    }
}

/// Priority-aware admission control in front of a rate-limited device.
///
/// Callers ask for admission with [`Limiter::acquire`] and talk to the device
/// only after it returns [`Outcome::Granted`]. One shared token bucket bounds
/// the command rate; priorities are served by rank, with optional floors,
/// private buckets and latest-only collapsing.
///
/// The limiter owns a dispatcher thread that handles replenishment. Dropping
/// the limiter stops it.
pub struct Limiter {
    shared: Arc<Shared>,
    config: LimiterConfig,
    _dispatcher: DispatcherThread,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();

        let mut priorities = BTreeMap::new();
        for &priority in config.per_priority.keys() {
            let bucket = BucketChoice::from_spec(config.bucket_for(priority)?, now);
            let floor = config
                .floor_for(priority)?
                .map(|spec| FloorState::new(spec, now));
            priorities.insert(
                priority,
                PriorityState::new(bucket, floor, config.latest_only(priority)),
            );
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(AdmissionState {
                shared: TokenBucket::new(config.default_rate_limit, config.time_window(), now),
                priorities,
            }),
            signal: WorkSignal::default(),
            stats: StatsCounters::default(),
            next_ticket: AtomicU64::new(1),
        });
        let dispatcher = DispatcherThread::spawn(Arc::clone(&shared)).map_err(Error::Spawn)?;

        info!(
            rate_limit = config.default_rate_limit,
            window_secs = config.default_time_window,
            priorities = config.per_priority.len(),
            "admission limiter started"
        );

        Ok(Self {
            shared,
            config,
            _dispatcher: dispatcher,
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Blocks the calling thread until the request is granted or superseded.
    pub fn acquire(&self, priority: Priority) -> Outcome {
        let slot = Arc::new(OutcomeSlot::default());
        self.enqueue(priority, Box::new(Arc::clone(&slot)));
        slot.wait()
    }

    /// Like [`Limiter::acquire`], but gives up after `wait`.
    ///
    /// `None` means the ticket was withdrawn before it was resolved; no token
    /// was consumed for it.
    pub fn acquire_timeout(&self, priority: Priority, wait: Duration) -> Option<Outcome> {
        let slot = Arc::new(OutcomeSlot::default());
        let handle = self.enqueue(priority, Box::new(Arc::clone(&slot)));
        if let Some(outcome) = slot.wait_timeout(wait) {
            return Some(outcome);
        }
        match self.cancel(handle) {
            CancelResult::Cancelled => None,
            // Resolved while we were timing out; delivery is imminent.
            CancelResult::NotFound => Some(slot.wait()),
        }
    }

    /// Queues a ticket whose resolution is reported to `completion`.
    ///
    /// This is the seam used by async adapters; most callers want
    /// [`Limiter::acquire`].
    pub fn enqueue(&self, priority: Priority, completion: Box<dyn Completion>) -> TicketHandle {
        let id = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let (superseded, cycle) = {
            let mut state = self.shared.state.lock();
            let priority_state = state.priorities.entry(priority).or_insert_with(|| {
                debug!(%priority, "registering unconfigured priority");
                PriorityState::unconfigured()
            });

            let mut superseded = Vec::new();
            if priority_state.latest_only {
                priority_state.generation += 1;
                while let Some(stale) = priority_state.queue.pop_front() {
                    priority_state.superseded += 1;
                    superseded.push(Resolution::new(stale, Outcome::Superseded));
                }
                if !superseded.is_empty() {
                    debug!(
                        %priority,
                        count = superseded.len(),
                        generation = priority_state.generation,
                        "superseded pending tickets"
                    );
                }
            }

            let generation = priority_state.generation;
            priority_state.queue.push_back(Ticket {
                id,
                generation,
                enqueued_at: now,
                completion,
            });
            StatsCounters::add(&self.shared.stats.pending, 1);

            (superseded, state.dispatch(now))
        };

        StatsCounters::add(&self.shared.stats.superseded, superseded.len() as u64);
        StatsCounters::sub(&self.shared.stats.pending, superseded.len() as u64);
        self.shared.record(&cycle.resolutions, cycle.wait_ns);
        let still_waiting = cycle.next_wakeup.is_some();

        deliver(superseded);
        deliver(cycle.resolutions);

        if still_waiting {
            self.shared.signal.notify_all();
        }

        TicketHandle { priority, id }
    }

    /// Withdraws a queued ticket without consuming a token.
    ///
    /// The ticket's completion is dropped unresolved; the caller owns the
    /// decision to stop waiting.
    pub fn cancel(&self, handle: TicketHandle) -> CancelResult {
        let removed = {
            let mut state = self.shared.state.lock();
            let Some(priority_state) = state.priorities.get_mut(&handle.priority) else {
                return CancelResult::NotFound;
            };
            let Some(index) = priority_state
                .queue
                .iter()
                .position(|ticket| ticket.id == handle.id)
            else {
                return CancelResult::NotFound;
            };
            priority_state.cancelled += 1;
            priority_state.queue.remove(index)
        };

        debug!(priority = %handle.priority, ticket = handle.id, "ticket cancelled");
        StatsCounters::add(&self.shared.stats.cancelled, 1);
        StatsCounters::sub(&self.shared.stats.pending, 1);
        self.shared.signal.notify_all();
        drop(removed);
        CancelResult::Cancelled
    }

    /// Tokens left in the shared bucket, after any due refill.
    pub fn available_tokens(&self) -> u32 {
        let mut state = self.shared.state.lock();
        state.refill(Instant::now());
        state.shared.available()
    }

    pub fn stats(&self) -> LimiterStats {
        let (available_tokens, capacity, priorities) = {
            let mut state = self.shared.state.lock();
            state.refill(Instant::now());
            let priorities = state
                .priorities
                .iter()
                .map(|(priority, state)| PriorityStats {
                    priority: *priority,
                    pending: state.queue.len() as u64,
                    granted: state.granted,
                    superseded: state.superseded,
                    cancelled: state.cancelled,
                    generation: state.generation,
                    floor_progress: state
                        .floor
                        .as_ref()
                        .map(|floor| (floor.granted_in_window, floor.min_calls)),
                    private_tokens: match &state.bucket {
                        BucketChoice::Private(bucket) => Some(bucket.available()),
                        _ => None,
                    },
                })
                .collect::<Vec<_>>();
            (state.shared.available(), state.shared.capacity(), priorities)
        };

        let stats = &self.shared.stats;
        LimiterStats {
            available_tokens,
            capacity,
            granted: stats.granted.load(Ordering::Relaxed),
            superseded: stats.superseded.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            pending: stats.pending.load(Ordering::Relaxed),
            wait_time_sum_ns: stats.wait_time_sum_ns.load(Ordering::Relaxed),
            wait_time_samples: stats.wait_time_samples.load(Ordering::Relaxed),
            priorities,
        }
    }
}
