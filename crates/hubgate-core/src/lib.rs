//! Hubgate core: admission control for a rate-limited device hub.
//!
//! A home-automation hub cannot absorb unbounded concurrent commands. Every
//! caller asks the [`Limiter`] for admission before talking to the device and
//! only sends once it is granted.
//!
//! Model:
//! - A shared token bucket refilled to capacity at each window boundary.
//! - Priorities served by rank (`Priority::EVENT` before `Priority::POLLING`),
//!   strict FIFO within a priority.
//! - Floors: a priority with `min_calls` per `floor_window` jumps ahead of
//!   higher ranks until the floor is met, as long as it has work queued.
//! - Private buckets and unmetered priorities bypass the shared bucket.
//! - Latest-only priorities keep only their freshest ticket; older ones are
//!   resolved [`Outcome::Superseded`] through a generation counter.
//!
//! The core is runtime-agnostic. Blocking callers use [`Limiter::acquire`];
//! the `hubgate-async` crate plugs tokio futures in through [`Completion`].

mod api;
mod bucket;
pub mod config;
mod dispatcher;
mod error;
mod limiter;
pub mod prometheus;
mod state;

pub use api::{CancelResult, LimiterStats, Outcome, Priority, PriorityStats, TicketHandle};
pub use config::{LimiterConfig, PriorityPolicy};
pub use error::{Error, Result};
pub use limiter::Limiter;
pub use state::Completion;

#[cfg(test)]
mod tests;
