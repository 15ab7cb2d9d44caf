use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bucket::TokenBucket;
use crate::config::FloorSpec;
use crate::dispatcher::AdmissionState;
use crate::state::{BucketChoice, FloorState, PriorityState, Ticket};
use crate::{CancelResult, Completion, Limiter, LimiterConfig, Outcome, Priority, PriorityPolicy};

struct Record {
    label: u64,
    tx: mpsc::Sender<(u64, Outcome)>,
}

impl Completion for Record {
    fn complete(self: Box<Self>, outcome: Outcome) {
        let _ = self.tx.send((self.label, outcome));
    }
}

fn record(label: u64, tx: &mpsc::Sender<(u64, Outcome)>) -> Box<Record> {
    Box::new(Record {
        label,
        tx: tx.clone(),
    })
}

fn recv(rx: &mpsc::Receiver<(u64, Outcome)>) -> (u64, Outcome) {
    rx.recv_timeout(Duration::from_secs(3))
        .expect("ticket was not resolved in time")
}

fn limiter(rate_limit: u32, window_secs: f64) -> Limiter {
    Limiter::new(LimiterConfig::new(rate_limit, window_secs)).unwrap()
}

#[test]
fn capacity_is_granted_at_once_then_sixth_waits_for_refill() {
    let start = Instant::now();
    let limiter = Arc::new(limiter(5, 1.0));

    let callers: Vec<_> = (0..5)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.acquire(Priority::EVENT))
        })
        .collect();
    for caller in callers {
        assert_eq!(caller.join().unwrap(), Outcome::Granted);
    }
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(limiter.available_tokens(), 0);

    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);
    assert!(
        start.elapsed() >= Duration::from_millis(950),
        "sixth grant came after {:?}",
        start.elapsed()
    );

    thread::sleep(Duration::from_millis(1_100));
    assert_eq!(limiter.available_tokens(), 5);
}

#[test]
fn fifo_within_a_priority() {
    let limiter = limiter(1, 0.1);
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let (tx, rx) = mpsc::channel();
    for label in [1, 2, 3] {
        limiter.enqueue(Priority::new(5), record(label, &tx));
    }

    let order: Vec<_> = (0..3).map(|_| recv(&rx)).collect();
    assert_eq!(
        order,
        vec![
            (1, Outcome::Granted),
            (2, Outcome::Granted),
            (3, Outcome::Granted)
        ]
    );
}

#[test]
fn lower_rank_is_dispatched_first() {
    let limiter = limiter(1, 0.2);
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let (tx, rx) = mpsc::channel();
    limiter.enqueue(Priority::POLLING, record(2, &tx));
    limiter.enqueue(Priority::EVENT, record(1, &tx));

    assert_eq!(recv(&rx), (1, Outcome::Granted));
    assert_eq!(recv(&rx), (2, Outcome::Granted));
}

#[test]
fn latest_only_keeps_only_the_last_request() {
    let config = LimiterConfig::new(1, 0.3)
        .with_priority(Priority::POLLING, PriorityPolicy::default().latest_only());
    let limiter = Limiter::new(config).unwrap();
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let (tx, rx) = mpsc::channel();
    for label in 1..=5 {
        limiter.enqueue(Priority::POLLING, record(label, &tx));
    }

    // Supersession is immediate; the survivor waits for the refill.
    for expected in 1..=4 {
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)).unwrap(),
            (expected, Outcome::Superseded)
        );
    }
    assert_eq!(recv(&rx), (5, Outcome::Granted));

    let stats = limiter.stats();
    assert_eq!(stats.superseded, 4);
    assert_eq!(stats.granted, 2);
    assert_eq!(stats.pending, 0);
    let polling = stats
        .priorities
        .iter()
        .find(|entry| entry.priority == Priority::POLLING)
        .unwrap();
    assert_eq!(polling.generation, 5);
}

#[test]
fn superseded_caller_never_reaches_the_device() {
    let config = LimiterConfig::new(1, 0.3)
        .with_priority(Priority::POLLING, PriorityPolicy::default().latest_only());
    let limiter = Arc::new(Limiter::new(config).unwrap());
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let sends = Arc::new(AtomicUsize::new(0));
    let call = |limiter: Arc<Limiter>, sends: Arc<AtomicUsize>| {
        thread::spawn(move || {
            let outcome = limiter.acquire(Priority::POLLING);
            if outcome.is_granted() {
                sends.fetch_add(1, Ordering::SeqCst);
            }
            outcome
        })
    };

    let first = call(Arc::clone(&limiter), Arc::clone(&sends));
    while limiter.stats().pending == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    let second = call(Arc::clone(&limiter), Arc::clone(&sends));

    assert_eq!(first.join().unwrap(), Outcome::Superseded);
    assert_eq!(second.join().unwrap(), Outcome::Granted);
    assert_eq!(sends.load(Ordering::SeqCst), 1);
}

#[test]
fn timeout_withdraws_ticket_without_spending_a_token() {
    let limiter = limiter(1, 10.0);
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    assert_eq!(
        limiter.acquire_timeout(Priority::EVENT, Duration::from_millis(30)),
        None
    );
    let stats = limiter.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.available_tokens, 0);
}

#[test]
fn cancel_of_resolved_ticket_is_not_found() {
    let limiter = limiter(2, 10.0);
    let (tx, rx) = mpsc::channel();
    let handle = limiter.enqueue(Priority::EVENT, record(1, &tx));
    assert_eq!(recv(&rx), (1, Outcome::Granted));
    assert_eq!(limiter.cancel(handle), CancelResult::NotFound);
}

#[test]
fn private_bucket_does_not_touch_shared_tokens() {
    let config = LimiterConfig::new(1, 10.0).with_priority(
        Priority::new(3),
        PriorityPolicy::default().private_bucket(2, 10.0),
    );
    let limiter = Limiter::new(config).unwrap();

    assert_eq!(limiter.acquire(Priority::new(3)), Outcome::Granted);
    assert_eq!(limiter.acquire(Priority::new(3)), Outcome::Granted);
    assert_eq!(limiter.available_tokens(), 1);
    assert_eq!(
        limiter.acquire_timeout(Priority::new(3), Duration::from_millis(30)),
        None
    );
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let stats = limiter.stats();
    let private = stats
        .priorities
        .iter()
        .find(|entry| entry.priority == Priority::new(3))
        .unwrap();
    assert_eq!(private.private_tokens, Some(0));
}

#[test]
fn unmetered_priority_bypasses_exhausted_bucket() {
    let config = LimiterConfig::new(1, 10.0)
        .with_priority(Priority::new(0), PriorityPolicy::default().unmetered());
    let limiter = Limiter::new(config).unwrap();
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    for _ in 0..10 {
        assert_eq!(limiter.acquire(Priority::new(0)), Outcome::Granted);
    }
    assert_eq!(limiter.available_tokens(), 0);
}

#[test]
fn panicking_completion_does_not_poison_limiter() {
    struct Explode;
    impl Completion for Explode {
        fn complete(self: Box<Self>, _outcome: Outcome) {
            panic!("completion exploded");
        }
    }

    let limiter = limiter(5, 10.0);
    limiter.enqueue(Priority::EVENT, Box::new(Explode));
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);
    assert_eq!(limiter.stats().granted, 2);
}

#[test]
fn dropping_limiter_resolves_queued_tickets() {
    let limiter = limiter(1, 10.0);
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    let (tx, rx) = mpsc::channel();
    limiter.enqueue(Priority::EVENT, record(9, &tx));
    drop(limiter);
    assert_eq!(recv(&rx), (9, Outcome::Superseded));
}

#[test]
fn dropping_idle_limiter_returns_promptly() {
    for round in 0..50u64 {
        let limiter = limiter(5, 10.0);
        // Vary how far the dispatcher got into its idle wait.
        thread::sleep(Duration::from_micros(round * 200));

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            drop(limiter);
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "drop hung in round {round}"
        );
    }
}

#[test]
fn unbounded_timeout_waits_like_acquire() {
    let limiter = limiter(1, 0.2);
    assert_eq!(limiter.acquire(Priority::EVENT), Outcome::Granted);

    assert_eq!(
        limiter.acquire_timeout(Priority::EVENT, Duration::MAX),
        Some(Outcome::Granted)
    );
    let stats = limiter.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.cancelled, 0);
    assert_eq!(stats.granted, 2);
}

// Deterministic dispatch checks against simulated time.

const TICK: Duration = Duration::from_millis(100);

fn admission(start: Instant, floor: Option<FloorSpec>) -> AdmissionState {
    let mut priorities = BTreeMap::new();
    priorities.insert(Priority::EVENT, PriorityState::unconfigured());
    priorities.insert(
        Priority::POLLING,
        PriorityState::new(
            BucketChoice::Shared,
            floor.map(|spec| FloorState::new(spec, start)),
            false,
        ),
    );
    AdmissionState {
        shared: TokenBucket::new(1, TICK, start),
        priorities,
    }
}

fn push(
    state: &mut AdmissionState,
    priority: Priority,
    label: u64,
    tx: &mpsc::Sender<(u64, Outcome)>,
    now: Instant,
) {
    let priority_state = state.priorities.get_mut(&priority).unwrap();
    let generation = priority_state.generation;
    priority_state.queue.push_back(Ticket {
        id: label,
        generation,
        enqueued_at: now,
        completion: record(label, tx),
    });
}

fn run(state: &mut AdmissionState, now: Instant) {
    for resolution in state.dispatch(now).resolutions {
        resolution.completion.complete(resolution.outcome);
    }
}

fn granted(state: &AdmissionState, priority: Priority) -> u64 {
    state.priorities[&priority].granted
}

#[test]
fn floor_overrides_rank_under_contention() {
    let start = Instant::now();
    let (tx, _rx) = mpsc::channel();
    let mut state = admission(
        start,
        Some(FloorSpec {
            min_calls: 1,
            window: Duration::from_millis(250),
        }),
    );
    for label in 0..30 {
        push(&mut state, Priority::EVENT, label, &tx, start);
    }
    for label in 100..110 {
        push(&mut state, Priority::POLLING, label, &tx, start);
    }

    for tick in 0..=10 {
        run(&mut state, start + TICK * tick);
    }

    // Polling wins the first token of each 250ms window: t=0, 300, 600, 900.
    assert_eq!(granted(&state, Priority::POLLING), 4);
    assert_eq!(granted(&state, Priority::EVENT), 7);
}

#[test]
fn polling_floor_holds_every_minute_under_event_saturation() {
    let start = Instant::now();
    let window = Duration::from_secs(3);
    let (tx, _rx) = mpsc::channel();
    let mut state = admission(
        start,
        Some(FloorSpec {
            min_calls: 3,
            window: Duration::from_secs(60),
        }),
    );
    state.shared = TokenBucket::new(5, window, start);
    for label in 0..400 {
        push(&mut state, Priority::EVENT, label, &tx, start);
    }
    for label in 1_000..1_020 {
        push(&mut state, Priority::POLLING, label, &tx, start);
    }

    // Twenty refills per minute, three minutes.
    for minute in 0..3u32 {
        let polling_before = granted(&state, Priority::POLLING);
        let event_before = granted(&state, Priority::EVENT);
        for tick in minute * 20..(minute + 1) * 20 {
            run(&mut state, start + window * tick);
        }
        let polling = granted(&state, Priority::POLLING) - polling_before;
        let event = granted(&state, Priority::EVENT) - event_before;
        assert!(polling >= 3, "minute {minute}: polling got {polling}");
        assert_eq!(polling + event, 100, "minute {minute}: tokens left unused");
        assert!(!state.priorities[&Priority::EVENT].queue.is_empty());
    }
}

#[test]
fn without_floor_higher_rank_starves_lower() {
    let start = Instant::now();
    let (tx, _rx) = mpsc::channel();
    let mut state = admission(start, None);
    for label in 0..30 {
        push(&mut state, Priority::EVENT, label, &tx, start);
    }
    push(&mut state, Priority::POLLING, 100, &tx, start);

    for tick in 0..=10 {
        run(&mut state, start + TICK * tick);
    }
    assert_eq!(granted(&state, Priority::POLLING), 0);
    assert_eq!(granted(&state, Priority::EVENT), 11);
}

#[test]
fn idle_floor_window_does_not_bank_credit() {
    let start = Instant::now();
    let (tx, _rx) = mpsc::channel();
    let mut state = admission(
        start,
        Some(FloorSpec {
            min_calls: 2,
            window: Duration::from_millis(500),
        }),
    );
    for label in 0..30 {
        push(&mut state, Priority::EVENT, label, &tx, start);
    }

    for tick in 0..5 {
        run(&mut state, start + TICK * tick);
    }
    assert_eq!(granted(&state, Priority::POLLING), 0);

    for label in 100..105 {
        push(&mut state, Priority::POLLING, label, &tx, start + TICK * 5);
    }
    for tick in 5..10 {
        run(&mut state, start + TICK * tick);
    }
    assert_eq!(granted(&state, Priority::POLLING), 2);
    assert_eq!(granted(&state, Priority::EVENT), 8);
}

#[test]
fn faulty_priority_is_skipped_and_others_progress() {
    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    let mut state = admission(start, None);
    state.shared = TokenBucket::new(5, TICK, start);

    state
        .priorities
        .get_mut(&Priority::EVENT)
        .unwrap()
        .queue
        .push_back(Ticket {
            id: 1,
            generation: 7,
            enqueued_at: start,
            completion: record(1, &tx),
        });
    push(&mut state, Priority::POLLING, 2, &tx, start);

    run(&mut state, start);

    let mut outcomes: Vec<_> = rx.try_iter().collect();
    outcomes.sort_by_key(|(label, _)| *label);
    assert_eq!(
        outcomes,
        vec![(1, Outcome::Superseded), (2, Outcome::Granted)]
    );
    assert_eq!(state.shared.available(), 4);
}

#[test]
fn next_wakeup_tracks_blocking_bucket() {
    let start = Instant::now();
    let (tx, _rx) = mpsc::channel();
    let mut state = admission(start, None);
    push(&mut state, Priority::EVENT, 1, &tx, start);
    push(&mut state, Priority::EVENT, 2, &tx, start);

    let cycle = state.dispatch(start);
    assert_eq!(cycle.resolutions.len(), 1);
    assert_eq!(cycle.next_wakeup, Some(start + TICK));
    drop(cycle);

    let cycle = state.dispatch(start + TICK);
    assert_eq!(cycle.resolutions.len(), 1);
    assert_eq!(cycle.next_wakeup, None);
}
