use std::time::{Duration, Instant};

/// Fixed-window token counter.
///
/// The bucket is not synchronized on its own; it lives inside the limiter's
/// single state lock so that checking and consuming a token is one step.
/// Refill is lazy: whoever observes the bucket after a window boundary
/// resets it, and the refill instant stays on the grid started at `new`.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: u32,
    window: Duration,
    count: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// `capacity` and `window` are validated by the config layer.
    pub(crate) fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        debug_assert!(capacity > 0 && !window.is_zero());
        Self {
            capacity,
            window,
            count: capacity,
            last_refill: now,
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn available(&self) -> u32 {
        self.count
    }

    pub(crate) fn next_refill(&self) -> Instant {
        self.last_refill + self.window
    }

    /// Resets the count to capacity if a window boundary has passed.
    ///
    /// Returns `true` when a refill happened.
    pub(crate) fn refill_if_due(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < self.window {
            return false;
        }
        let windows = (elapsed.as_nanos() / self.window.as_nanos()).min(u128::from(u32::MAX));
        self.last_refill += self.window * windows as u32;
        self.count = self.capacity;
        true
    }

    /// Takes one token if any is left.
    pub(crate) fn try_consume(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }
}
