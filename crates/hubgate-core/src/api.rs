use std::fmt;

use serde::{Deserialize, Serialize};

/// Traffic class identified by its dispatch rank.
///
/// Lower ranks are dispatched first unless a floor guarantee says otherwise.
/// Ordering is defined by the rank alone, so the precedence table is whatever
/// ranks the caller assigns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Device events and user commands; latency-sensitive.
    pub const EVENT: Priority = Priority(1);
    /// Periodic state refreshes.
    pub const POLLING: Priority = Priority(2);

    pub const fn new(rank: u8) -> Self {
        Self(rank)
    }

    pub const fn rank(self) -> u8 {
        self.0
    }
}

impl From<u8> for Priority {
    fn from(rank: u8) -> Self {
        Self(rank)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Priority::EVENT => write!(f, "event(rank 1)"),
            Priority::POLLING => write!(f, "polling(rank 2)"),
            Priority(rank) => write!(f, "rank {rank}"),
        }
    }
}

/// How an admission request was resolved.
///
/// `Superseded` is not a failure: a fresher request of the same latest-only
/// priority took this one's place, and the caller should simply return.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Granted,
    Superseded,
}

impl Outcome {
    pub fn is_granted(self) -> bool {
        matches!(self, Outcome::Granted)
    }
}

/// Identifies a queued ticket for cancellation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TicketHandle {
    pub(crate) priority: Priority,
    pub(crate) id: u64,
}

impl TicketHandle {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CancelResult {
    /// Ticket was still queued and has been removed without consuming a token.
    Cancelled,
    /// Ticket was already resolved (or never existed).
    NotFound,
}

/// Snapshot of limiter counters.
#[derive(Clone, Debug, Default)]
pub struct LimiterStats {
    /// Tokens left in the shared bucket.
    pub available_tokens: u32,
    /// Shared bucket capacity.
    pub capacity: u32,
    /// Total tickets granted.
    pub granted: u64,
    /// Total tickets superseded by a fresher latest-only request.
    pub superseded: u64,
    /// Total tickets withdrawn by their caller.
    pub cancelled: u64,
    /// Tickets currently waiting.
    pub pending: u64,
    /// Sum of enqueue-to-grant time (nanoseconds) over granted tickets.
    pub wait_time_sum_ns: u64,
    /// Number of samples in `wait_time_sum_ns`.
    pub wait_time_samples: u64,
    /// Per-priority breakdown in rank order.
    pub priorities: Vec<PriorityStats>,
}

#[derive(Clone, Debug)]
pub struct PriorityStats {
    pub priority: Priority,
    pub pending: u64,
    pub granted: u64,
    pub superseded: u64,
    pub cancelled: u64,
    /// Current latest-only generation.
    pub generation: u64,
    /// Grants counted toward the floor in the active window, if a floor applies.
    pub floor_progress: Option<(u32, u32)>,
    /// Tokens left in the private bucket, if the priority has one.
    pub private_tokens: Option<u32>,
}
