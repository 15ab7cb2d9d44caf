//! Tokio adapter for `hubgate-core`.
//!
//! This crate provides:
//! - `AsyncLimiter::acquire`, which suspends only the calling task
//! - `AsyncLimiter::acquire_timeout` for bounded waits
//! - `AsyncLimiter::run`, which performs the device call only after a grant
//!
//! Dropping an `acquire` future before it resolves withdraws its ticket, so
//! an abandoned request never spends a token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use hubgate_core::{
    CancelResult, Completion, Error, Limiter, LimiterConfig, LimiterStats, Outcome, Priority,
    PriorityPolicy, PriorityStats, Result, TicketHandle, config, prometheus,
};
use tokio::sync::oneshot;
use tracing::debug;

/// Async wrapper around [`Limiter`].
///
/// Clones share one limiter. Dropping the last handle stops the dispatcher
/// thread and joins it, which blocks the dropping thread briefly. Inside a
/// runtime, keep a handle alive outside the tasks (or drop it from
/// `spawn_blocking`) so that join never runs on a worker thread. Pending
/// `acquire` futures also hold the limiter until they are dropped.
pub struct AsyncLimiter {
    inner: Arc<Limiter>,
}

impl Clone for AsyncLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for AsyncLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AsyncLimiter").field(&self.inner).finish()
    }
}

struct OneshotCompletion(oneshot::Sender<Outcome>);

impl Completion for OneshotCompletion {
    fn complete(self: Box<Self>, outcome: Outcome) {
        let _ = self.0.send(outcome);
    }
}

impl AsyncLimiter {
    /// Wraps a shared core limiter.
    pub fn new(inner: Arc<Limiter>) -> Self {
        Self { inner }
    }

    /// Builds a limiter from `config` and wraps it.
    pub fn from_config(config: LimiterConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(Limiter::new(config)?)))
    }

    /// Returns the shared core limiter.
    pub fn inner(&self) -> &Arc<Limiter> {
        &self.inner
    }

    /// Waits until the request is granted or superseded.
    pub async fn acquire(&self, priority: Priority) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let handle = self
            .inner
            .enqueue(priority, Box::new(OneshotCompletion(tx)));
        let mut guard = PendingCancelGuard::new(Arc::clone(&self.inner), handle);
        let outcome = rx.await;
        guard.disarm();
        // The sender is only dropped unresolved on cancellation, which this
        // future controls; treat it as superseded.
        outcome.unwrap_or(Outcome::Superseded)
    }

    /// Like [`AsyncLimiter::acquire`], giving up after `wait`.
    ///
    /// `None` means the ticket was withdrawn without consuming a token.
    pub async fn acquire_timeout(&self, priority: Priority, wait: Duration) -> Option<Outcome> {
        tokio::time::timeout(wait, self.acquire(priority)).await.ok()
    }

    /// Runs `call` once admission is granted.
    ///
    /// Returns `None` when a fresher request superseded this one, in which
    /// case `call` is never invoked.
    pub async fn run<F, Fut>(&self, priority: Priority, call: F) -> Option<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        match self.acquire(priority).await {
            Outcome::Granted => Some(call().await),
            Outcome::Superseded => {
                debug!(%priority, "skipping superseded call");
                None
            }
        }
    }

    /// Tokens left in the shared bucket.
    pub fn available_tokens(&self) -> u32 {
        self.inner.available_tokens()
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> LimiterStats {
        self.inner.stats()
    }
}

// Holds its own `Arc<Limiter>`: if it is the last owner, the limiter's
// blocking shutdown runs wherever the future is dropped.
struct PendingCancelGuard {
    limiter: Arc<Limiter>,
    handle: Option<TicketHandle>,
}

impl PendingCancelGuard {
    fn new(limiter: Arc<Limiter>, handle: TicketHandle) -> Self {
        Self {
            limiter,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for PendingCancelGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.limiter.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn limiter(rate_limit: u32, window_secs: f64) -> AsyncLimiter {
        AsyncLimiter::from_config(LimiterConfig::new(rate_limit, window_secs)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_within_capacity_are_granted() {
        let limiter = limiter(5, 1.0);
        let start = Instant::now();

        let outcomes = join_all((0..5).map(|_| limiter.acquire(Priority::EVENT))).await;
        assert!(outcomes.iter().all(|outcome| outcome.is_granted()));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caller_over_capacity_waits_for_refill() {
        let limiter = limiter(1, 0.3);
        let start = Instant::now();
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);
        assert!(start.elapsed() >= Duration::from_millis(280));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_future_withdraws_its_ticket() {
        let limiter = limiter(1, 10.0);
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);

        let outcome = limiter
            .acquire_timeout(Priority::EVENT, Duration::from_millis(30))
            .await;
        assert_eq!(outcome, None);

        let stats = limiter.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn latest_only_runs_the_device_call_once() {
        let config = LimiterConfig::new(1, 0.3)
            .with_priority(Priority::POLLING, PriorityPolicy::default().latest_only());
        let limiter = AsyncLimiter::from_config(config).unwrap();
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);

        let sends = Arc::new(AtomicUsize::new(0));
        let refresh = |limiter: AsyncLimiter, sends: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                limiter
                    .run(Priority::POLLING, || async {
                        sends.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };

        let first = refresh(limiter.clone(), Arc::clone(&sends));
        while limiter.stats().pending == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = refresh(limiter.clone(), Arc::clone(&sends));

        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.await.unwrap(), Some(()));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_traffic_overtakes_queued_polling() {
        let limiter = limiter(1, 0.2);
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);

        let order = Arc::new(Mutex::new(Vec::new()));
        let polling = {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                limiter.acquire(Priority::POLLING).await;
                order.lock().unwrap().push(Priority::POLLING);
            })
        };
        while limiter.stats().pending == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let event = {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                limiter.acquire(Priority::EVENT).await;
                order.lock().unwrap().push(Priority::EVENT);
            })
        };

        event.await.unwrap();
        polling.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![Priority::EVENT, Priority::POLLING]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_handle_dropped_off_the_runtime_shuts_down() {
        let limiter = limiter(1, 10.0);
        assert_eq!(limiter.acquire(Priority::EVENT).await, Outcome::Granted);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Priority::EVENT).await })
        };
        while limiter.stats().pending == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(limiter.stats().cancelled, 1);

        let dropped = tokio::task::spawn_blocking(move || drop(limiter));
        tokio::time::timeout(Duration::from_secs(5), dropped)
            .await
            .expect("limiter shutdown hung")
            .unwrap();
    }
}
