use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::api::Outcome;
use crate::bucket::TokenBucket;
use crate::config::{BucketSpec, FloorSpec};

/// Receives the resolution of a ticket.
///
/// Called exactly once, after the limiter's state lock has been released.
pub trait Completion: Send + 'static {
    fn complete(self: Box<Self>, outcome: Outcome);
}

/// Completion used by blocking callers: a slot plus a condvar.
#[derive(Debug, Default)]
pub(crate) struct OutcomeSlot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl OutcomeSlot {
    pub(crate) fn set(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    pub(crate) fn wait(&self) -> Outcome {
        let mut guard = self.outcome.lock();
        loop {
            if let Some(outcome) = *guard {
                return outcome;
            }
            self.ready.wait(&mut guard);
        }
    }

    pub(crate) fn wait_timeout(&self, wait: Duration) -> Option<Outcome> {
        // A wait too long to express as an instant never times out.
        let Some(deadline) = Instant::now().checked_add(wait) else {
            return Some(self.wait());
        };
        let mut guard = self.outcome.lock();
        loop {
            if let Some(outcome) = *guard {
                return Some(outcome);
            }
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
    }
}

impl Completion for std::sync::Arc<OutcomeSlot> {
    fn complete(self: Box<Self>, outcome: Outcome) {
        self.set(outcome);
    }
}

/// One pending `acquire` call.
pub(crate) struct Ticket {
    pub(crate) id: u64,
    pub(crate) generation: u64,
    pub(crate) enqueued_at: Instant,
    pub(crate) completion: Box<dyn Completion>,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// A ticket resolution waiting to be delivered outside the lock.
pub(crate) struct Resolution {
    pub(crate) completion: Box<dyn Completion>,
    pub(crate) outcome: Outcome,
}

impl Resolution {
    pub(crate) fn new(ticket: Ticket, outcome: Outcome) -> Self {
        Self {
            completion: ticket.completion,
            outcome,
        }
    }
}

#[derive(Debug)]
pub(crate) enum BucketChoice {
    Shared,
    Private(TokenBucket),
    Unmetered,
}

impl BucketChoice {
    pub(crate) fn from_spec(spec: BucketSpec, now: Instant) -> Self {
        match spec {
            BucketSpec::Shared => BucketChoice::Shared,
            BucketSpec::Private { capacity, window } => {
                BucketChoice::Private(TokenBucket::new(capacity, window, now))
            }
            BucketSpec::Unmetered => BucketChoice::Unmetered,
        }
    }
}

/// Floor counters for one priority.
#[derive(Debug)]
pub(crate) struct FloorState {
    pub(crate) min_calls: u32,
    pub(crate) window: Duration,
    pub(crate) granted_in_window: u32,
    pub(crate) window_start: Instant,
}

impl FloorState {
    pub(crate) fn new(spec: FloorSpec, now: Instant) -> Self {
        Self {
            min_calls: spec.min_calls,
            window: spec.window,
            granted_in_window: 0,
            window_start: now,
        }
    }

    /// Starts a new window once the current one has elapsed. Unused credit
    /// is discarded.
    pub(crate) fn roll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) < self.window {
            return false;
        }
        self.granted_in_window = 0;
        self.window_start = now;
        true
    }

    pub(crate) fn unmet(&self) -> bool {
        self.granted_in_window < self.min_calls
    }
}

#[derive(Debug)]
pub(crate) struct PriorityState {
    pub(crate) queue: VecDeque<Ticket>,
    pub(crate) generation: u64,
    pub(crate) latest_only: bool,
    pub(crate) bucket: BucketChoice,
    pub(crate) floor: Option<FloorState>,
    pub(crate) granted: u64,
    pub(crate) superseded: u64,
    pub(crate) cancelled: u64,
}

impl PriorityState {
    pub(crate) fn new(
        bucket: BucketChoice,
        floor: Option<FloorState>,
        latest_only: bool,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            generation: 0,
            latest_only,
            bucket,
            floor,
            granted: 0,
            superseded: 0,
            cancelled: 0,
        }
    }

    pub(crate) fn unconfigured() -> Self {
        Self::new(BucketChoice::Shared, None, false)
    }

    /// The floor override applies only while work is waiting.
    pub(crate) fn floor_unmet(&self) -> bool {
        !self.queue.is_empty() && self.floor.as_ref().is_some_and(FloorState::unmet)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) granted: AtomicU64,
    pub(crate) superseded: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) pending: AtomicU64,
    pub(crate) wait_time_sum_ns: AtomicU64,
    pub(crate) wait_time_samples: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn add(counter: &AtomicU64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(delta);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn sub(counter: &AtomicU64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Sequence-numbered wake signal for the dispatcher thread.
///
/// Waiters capture `current()` before inspecting state and then wait for the
/// sequence to move, so a notification between the two is never lost.
#[derive(Debug, Default)]
pub(crate) struct WorkSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
    seq: AtomicU64,
}

impl WorkSignal {
    pub(crate) fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.seq.fetch_add(1, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn wait_for_change(&self, last_seen: u64) {
        let mut guard = self.mutex.lock();
        while self.seq.load(Ordering::Acquire) == last_seen {
            self.condvar.wait(&mut guard);
        }
    }

    /// Returns `false` if the deadline passed without a change.
    pub(crate) fn wait_for_change_until(&self, last_seen: u64, deadline: Instant) -> bool {
        let mut guard = self.mutex.lock();
        while self.seq.load(Ordering::Acquire) == last_seen {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return self.seq.load(Ordering::Acquire) != last_seen;
            }
        }
        true
    }
}
