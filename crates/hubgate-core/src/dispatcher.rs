use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::api::{Outcome, Priority};
use crate::bucket::TokenBucket;
use crate::error::DispatchError;
use crate::limiter::Shared;
use crate::state::{BucketChoice, PriorityState, Resolution, StatsCounters};

/// Everything guarded by the limiter's single lock.
#[derive(Debug)]
pub(crate) struct AdmissionState {
    pub(crate) shared: TokenBucket,
    pub(crate) priorities: BTreeMap<Priority, PriorityState>,
}

/// Result of one dispatch cycle.
pub(crate) struct Cycle {
    pub(crate) resolutions: Vec<Resolution>,
    pub(crate) wait_ns: u64,
    /// Earliest refill that could unblock a waiting ticket.
    pub(crate) next_wakeup: Option<Instant>,
}

enum Grant {
    Granted(Resolution, u64),
    Blocked,
    Empty,
}

impl AdmissionState {
    pub(crate) fn refill(&mut self, now: Instant) {
        if self.shared.refill_if_due(now) {
            debug!(tokens = self.shared.available(), "shared bucket refilled");
        }
        for (priority, state) in self.priorities.iter_mut() {
            if let BucketChoice::Private(bucket) = &mut state.bucket {
                if bucket.refill_if_due(now) {
                    debug!(%priority, tokens = bucket.available(), "private bucket refilled");
                }
            }
        }
    }

    /// Rank order, except that priorities with an unmet floor go first.
    fn dispatch_order(&self) -> Vec<Priority> {
        let (mut order, rest): (Vec<_>, Vec<_>) = self
            .priorities
            .iter()
            .filter(|(_, state)| !state.queue.is_empty())
            .map(|(priority, state)| (*priority, state.floor_unmet()))
            .partition(|(_, unmet)| *unmet);
        order.extend(rest);
        order.into_iter().map(|(priority, _)| priority).collect()
    }

    /// Grants as many head tickets as tokens allow.
    pub(crate) fn dispatch(&mut self, now: Instant) -> Cycle {
        self.refill(now);
        for state in self.priorities.values_mut() {
            if let Some(floor) = state.floor.as_mut() {
                floor.roll(now);
            }
        }

        let mut cycle = Cycle {
            resolutions: Vec::new(),
            wait_ns: 0,
            next_wakeup: None,
        };
        let mut skipped: Vec<Priority> = Vec::new();

        'greedy: loop {
            for priority in self.dispatch_order() {
                if skipped.contains(&priority) {
                    continue;
                }
                match self.try_grant(priority, now, &mut cycle.resolutions) {
                    Ok(Grant::Granted(resolution, wait_ns)) => {
                        cycle.resolutions.push(resolution);
                        cycle.wait_ns = cycle.wait_ns.saturating_add(wait_ns);
                        // Floor status may have changed; re-rank.
                        continue 'greedy;
                    }
                    Ok(Grant::Blocked) | Ok(Grant::Empty) => {}
                    Err(err) => {
                        warn!(%priority, error = %err, "skipping priority for this cycle");
                        skipped.push(priority);
                    }
                }
            }
            break;
        }

        cycle.next_wakeup = self.next_refill_for_waiters();
        cycle
    }

    fn try_grant(
        &mut self,
        priority: Priority,
        now: Instant,
        resolutions: &mut Vec<Resolution>,
    ) -> Result<Grant, DispatchError> {
        let Some(state) = self.priorities.get_mut(&priority) else {
            return Ok(Grant::Empty);
        };

        // Stale heads only exist if supersession missed them; resolve them here.
        while let Some(head) = state.queue.front() {
            if head.generation == state.generation {
                break;
            }
            let (ticket_id, found) = (head.id, head.generation);
            let Some(ticket) = state.queue.pop_front() else {
                break;
            };
            state.superseded += 1;
            resolutions.push(Resolution::new(ticket, Outcome::Superseded));
            if found > state.generation {
                return Err(DispatchError::GenerationAhead {
                    priority,
                    ticket: ticket_id,
                    found,
                    current: state.generation,
                });
            }
        }

        if state.queue.is_empty() {
            return Ok(Grant::Empty);
        }

        let admitted = match &mut state.bucket {
            BucketChoice::Shared => self.shared.try_consume(),
            BucketChoice::Private(bucket) => bucket.try_consume(),
            BucketChoice::Unmetered => true,
        };
        if !admitted {
            return Ok(Grant::Blocked);
        }

        let Some(ticket) = state.queue.pop_front() else {
            return Ok(Grant::Empty);
        };
        state.granted += 1;
        if let Some(floor) = state.floor.as_mut() {
            floor.granted_in_window = floor.granted_in_window.saturating_add(1);
        }
        let wait_ns = now
            .saturating_duration_since(ticket.enqueued_at)
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        trace!(%priority, ticket = ticket.id, wait_ns, "granted");
        Ok(Grant::Granted(Resolution::new(ticket, Outcome::Granted), wait_ns))
    }

    fn next_refill_for_waiters(&self) -> Option<Instant> {
        self.priorities
            .values()
            .filter(|state| !state.queue.is_empty())
            .filter_map(|state| match &state.bucket {
                BucketChoice::Shared => Some(self.shared.next_refill()),
                BucketChoice::Private(bucket) => Some(bucket.next_refill()),
                BucketChoice::Unmetered => None,
            })
            .min()
    }

    /// Removes every queued ticket, resolving it as superseded.
    pub(crate) fn drain(&mut self) -> Vec<Resolution> {
        let mut resolutions = Vec::new();
        for state in self.priorities.values_mut() {
            while let Some(ticket) = state.queue.pop_front() {
                state.superseded += 1;
                resolutions.push(Resolution::new(ticket, Outcome::Superseded));
            }
        }
        resolutions
    }
}

/// Hands outcomes to their completions, isolating panics in user sinks.
pub(crate) fn deliver(resolutions: Vec<Resolution>) {
    for Resolution {
        completion,
        outcome,
    } in resolutions
    {
        if catch_unwind(AssertUnwindSafe(|| completion.complete(outcome))).is_err() {
            warn!(?outcome, "ticket completion panicked");
        }
    }
}

/// Background thread that replenishes buckets and drains queues.
pub(crate) struct DispatcherThread {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DispatcherThread {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shared = Arc::clone(&shared);
        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("hubgate-dispatch".into())
            .spawn(move || run(&worker_shared, &worker_shutdown))?;
        Ok(Self {
            shared,
            shutdown,
            handle: Some(handle),
        })
    }
}

fn run(shared: &Shared, shutdown: &AtomicBool) {
    loop {
        // Read the sequence before the flag: a shutdown notify landing after
        // this point bumps it and the wait below returns at once.
        let observed = shared.signal.current();
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let next_wakeup = shared.run_cycle(Instant::now());
        match next_wakeup {
            Some(deadline) => {
                shared.signal.wait_for_change_until(observed, deadline);
            }
            None => shared.signal.wait_for_change(observed),
        }
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.shared.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }

        let leftovers = self.shared.state.lock().drain();
        if !leftovers.is_empty() {
            warn!(
                count = leftovers.len(),
                "limiter dropped with queued tickets; resolving as superseded"
            );
            StatsCounters::add(&self.shared.stats.superseded, leftovers.len() as u64);
            StatsCounters::sub(&self.shared.stats.pending, leftovers.len() as u64);
        }
        deliver(leftovers);
    }
}
